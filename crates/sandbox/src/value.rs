use crate::ast::Lambda;
use crate::error::{Result, SandboxError};
use crate::interp::builtins::Builtin;
use crate::interp::helpers::Helper;
use crate::interp::methods::Method;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Runtime value. Containers are shared and mutable like their Python
/// counterparts; callables are closed enums or user lambdas.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<Table>>),
    Set(Rc<RefCell<Table>>),
    Range(RangeValue),
    Lambda(Rc<Closure>),
    Builtin(Builtin),
    Helper(Helper),
    Method(Rc<BoundMethod>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValue {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeValue {
    pub fn len(&self) -> usize {
        let span = if self.step > 0 {
            (self.stop as i128 - self.start as i128 + self.step as i128 - 1) / self.step as i128
        } else {
            (self.start as i128 - self.stop as i128 - self.step as i128 - 1) / (-(self.step as i128))
        };
        usize::try_from(span.max(0)).unwrap_or(usize::MAX)
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        let value = self.start as i128 + self.step as i128 * index as i128;
        i64::try_from(value).ok()
    }
}

#[derive(Debug)]
pub struct Closure {
    pub lambda: Rc<Lambda>,
    /// Enclosing comprehension/lambda variables at creation time
    pub captured: Vec<(String, Value)>,
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Method,
}

impl Value {
    pub fn str(text: impl Into<Rc<str>>) -> Self {
        Value::Str(text.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(table: Table) -> Self {
        Value::Dict(Rc::new(RefCell::new(table)))
    }

    pub fn set(table: Table) -> Self {
        Value::Set(Rc::new(RefCell::new(table)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Range(_) => "range",
            Value::Lambda(_) => "function",
            Value::Builtin(_) | Value::Helper(_) => "builtin_function",
            Value::Method(_) => "method",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(table) | Value::Set(table) => !table.borrow().is_empty(),
            Value::Range(range) => range.len() > 0,
            Value::Lambda(_) | Value::Builtin(_) | Value::Helper(_) | Value::Method(_) => true,
        }
    }

    /// Integer view of ints and bools.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Numeric view of ints, bools and floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            other => other.as_int().map(|i| i as f64),
        }
    }

    pub fn expect_int(&self, what: &str) -> Result<i64> {
        self.as_int().ok_or_else(|| {
            SandboxError::type_error(format!(
                "{what} must be an integer, not '{}'",
                self.type_name()
            ))
        })
    }

    pub fn expect_str(&self, what: &str) -> Result<Rc<str>> {
        match self {
            Value::Str(s) => Ok(s.clone()),
            other => Err(SandboxError::type_error(format!(
                "{what} must be a str, not '{}'",
                other.type_name()
            ))),
        }
    }
}

/// Hashable projection of a value. Numbers that compare equal hash equal,
/// so `1`, `1.0` and `True` are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    None,
    Int(i64),
    Float(u64),
    Str(Rc<str>),
    Tuple(Vec<Key>),
}

impl Key {
    pub fn from_value(value: &Value) -> Result<Key> {
        Ok(match value {
            Value::None => Key::None,
            Value::Bool(b) => Key::Int(i64::from(*b)),
            Value::Int(i) => Key::Int(*i),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 9.0e15 {
                    Key::Int(*f as i64)
                } else {
                    Key::Float(f.to_bits())
                }
            }
            Value::Str(s) => Key::Str(s.clone()),
            Value::Tuple(items) => Key::Tuple(
                items
                    .iter()
                    .map(Key::from_value)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Range(range) => Key::Tuple(vec![
                Key::Str(Rc::from("range")),
                Key::Int(range.start),
                Key::Int(range.stop),
                Key::Int(range.step),
            ]),
            other => {
                return Err(SandboxError::type_error(format!(
                    "unhashable type: '{}'",
                    other.type_name()
                )))
            }
        })
    }
}

/// Insertion-ordered hash table backing dicts and sets.
#[derive(Debug, Clone, Default)]
pub struct Table {
    entries: Vec<(Value, Value)>,
    index: HashMap<Key, usize>,
}

impl Table {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> Result<Option<Value>> {
        let key = Key::from_value(key)?;
        Ok(self.index.get(&key).map(|&i| self.entries[i].1.clone()))
    }

    pub fn contains(&self, key: &Value) -> Result<bool> {
        Ok(self.index.contains_key(&Key::from_value(key)?))
    }

    pub fn insert(&mut self, key: Value, value: Value) -> Result<()> {
        let hashed = Key::from_value(&key)?;
        match self.index.get(&hashed) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(hashed, self.entries.len());
                self.entries.push((key, value));
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &Value) -> Result<Option<Value>> {
        let hashed = Key::from_value(key)?;
        let Some(position) = self.index.remove(&hashed) else {
            return Ok(None);
        };
        let (_, value) = self.entries.remove(position);
        for slot in self.index.values_mut() {
            if *slot > position {
                *slot -= 1;
            }
        }
        Ok(Some(value))
    }

    pub fn pop_last(&mut self) -> Option<(Value, Value)> {
        let (key, value) = self.entries.pop()?;
        if let Ok(hashed) = Key::from_value(&key) {
            self.index.remove(&hashed);
        }
        Some((key, value))
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn items(&self) -> Vec<(Value, Value)> {
        self.entries.clone()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub fn from_keys(keys: impl IntoIterator<Item = Value>) -> Result<Table> {
        let mut table = Table::default();
        for key in keys {
            table.insert(key, Value::None)?;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_keys_collapse() {
        let mut table = Table::default();
        table.insert(Value::Int(1), Value::str("a")).unwrap();
        table.insert(Value::Float(1.0), Value::str("b")).unwrap();
        table.insert(Value::Bool(true), Value::str("c")).unwrap();
        assert_eq!(table.len(), 1);
        assert!(matches!(table.get(&Value::Int(1)).unwrap(), Some(Value::Str(s)) if &*s == "c"));
    }

    #[test]
    fn removal_keeps_order_and_index() {
        let mut table = Table::default();
        for k in ["a", "b", "c"] {
            table.insert(Value::str(k), Value::None).unwrap();
        }
        table.remove(&Value::str("a")).unwrap();
        assert!(table.contains(&Value::str("c")).unwrap());
        let keys: Vec<String> = table
            .keys()
            .into_iter()
            .map(|k| match k {
                Value::Str(s) => s.to_string(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn lists_are_unhashable() {
        assert!(Key::from_value(&Value::list(vec![])).is_err());
    }

    #[test]
    fn range_length() {
        assert_eq!(RangeValue { start: 0, stop: 10, step: 3 }.len(), 4);
        assert_eq!(RangeValue { start: 10, stop: 0, step: -2 }.len(), 5);
        assert_eq!(RangeValue { start: 5, stop: 0, step: 1 }.len(), 0);
    }
}
