//! The closed set of builtin functions a program can name.

use super::render::{repr, str_of, str_repr};
use super::{ops, Args, Interp};
use crate::ast::BinOp;
use crate::error::{Result, RuntimeKind, SandboxError};
use crate::value::{RangeValue, Table, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Len,
    Range,
    Enumerate,
    Zip,
    Sorted,
    Reversed,
    Min,
    Max,
    Sum,
    Abs,
    Round,
    Any,
    All,
    Str,
    Int,
    Float,
    Bool,
    List,
    Tuple,
    Dict,
    Set,
    Print,
    Repr,
    TypeName,
    Map,
    Filter,
}

impl Builtin {
    const ALL: &'static [Builtin] = &[
        Self::Len,
        Self::Range,
        Self::Enumerate,
        Self::Zip,
        Self::Sorted,
        Self::Reversed,
        Self::Min,
        Self::Max,
        Self::Sum,
        Self::Abs,
        Self::Round,
        Self::Any,
        Self::All,
        Self::Str,
        Self::Int,
        Self::Float,
        Self::Bool,
        Self::List,
        Self::Tuple,
        Self::Dict,
        Self::Set,
        Self::Print,
        Self::Repr,
        Self::TypeName,
        Self::Map,
        Self::Filter,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| b.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Len => "len",
            Self::Range => "range",
            Self::Enumerate => "enumerate",
            Self::Zip => "zip",
            Self::Sorted => "sorted",
            Self::Reversed => "reversed",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Abs => "abs",
            Self::Round => "round",
            Self::Any => "any",
            Self::All => "all",
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Tuple => "tuple",
            Self::Dict => "dict",
            Self::Set => "set",
            Self::Print => "print",
            Self::Repr => "repr",
            Self::TypeName => "type_name",
            Self::Map => "map",
            Self::Filter => "filter",
        }
    }
}

pub(crate) fn call(interp: &mut Interp<'_>, builtin: Builtin, mut args: Args) -> Result<Value> {
    match builtin {
        Builtin::Len => {
            args.check(1, 1)?;
            let value = args.required(0, "obj")?;
            args.finish()?;
            let len = match &value {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.borrow().len(),
                Value::Tuple(items) => items.len(),
                Value::Dict(table) | Value::Set(table) => table.borrow().len(),
                Value::Range(range) => range.len(),
                other => {
                    return Err(SandboxError::type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )))
                }
            };
            Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
        }
        Builtin::Range => {
            args.check(1, 3)?;
            let ints = args
                .into_positional()?
                .iter()
                .map(|v| v.expect_int("range() argument"))
                .collect::<Result<Vec<_>>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => return Err(SandboxError::type_error("range expected at most 3 arguments")),
            };
            if step == 0 {
                return Err(SandboxError::value_error("range() arg 3 must not be zero"));
            }
            Ok(Value::Range(RangeValue { start, stop, step }))
        }
        Builtin::Enumerate => {
            args.check(1, 2)?;
            let iterable = args.required(0, "iterable")?;
            let start = match args.arg(1, "start") {
                Some(v) => v.expect_int("enumerate() start")?,
                None => 0,
            };
            args.finish()?;
            let items = interp.collect(iterable)?;
            let mut out = Vec::with_capacity(items.len());
            for (offset, item) in items.into_iter().enumerate() {
                let index = start.checked_add(offset as i64).ok_or_else(|| {
                    SandboxError::runtime(RuntimeKind::OverflowError, "enumerate index overflow")
                })?;
                out.push(Value::tuple(vec![Value::Int(index), item]));
            }
            Ok(Value::list(out))
        }
        Builtin::Zip => {
            let iterables = args.into_positional()?;
            let mut columns = Vec::with_capacity(iterables.len());
            for iterable in iterables {
                columns.push(interp.collect(iterable)?);
            }
            let len = columns.iter().map(Vec::len).min().unwrap_or(0);
            let rows = (0..len)
                .map(|i| Value::tuple(columns.iter().map(|c| c[i].clone()).collect()))
                .collect();
            Ok(Value::list(rows))
        }
        Builtin::Sorted => {
            args.check(1, 1)?;
            let iterable = args.required(0, "iterable")?;
            let key = args.keyword("key").filter(|k| !matches!(k, Value::None));
            let reverse = args.keyword("reverse").is_some_and(|r| r.truthy());
            args.finish()?;
            let items = interp.collect(iterable)?;
            Ok(Value::list(sort_values(interp, items, key.as_ref(), reverse)?))
        }
        Builtin::Reversed => {
            args.check(1, 1)?;
            let value = args.required(0, "sequence")?;
            args.finish()?;
            if matches!(value, Value::Dict(_) | Value::Set(_)) {
                return Err(SandboxError::type_error(format!(
                    "'{}' object is not reversible",
                    value.type_name()
                )));
            }
            let mut items = interp.collect(value)?;
            items.reverse();
            Ok(Value::list(items))
        }
        Builtin::Min | Builtin::Max => extreme(interp, builtin, args),
        Builtin::Sum => {
            args.check(1, 2)?;
            let iterable = args.required(0, "iterable")?;
            let mut total = args.arg(1, "start").unwrap_or(Value::Int(0));
            args.finish()?;
            if matches!(total, Value::Str(_)) {
                return Err(SandboxError::type_error(
                    "sum() can't sum strings [use ''.join(seq) instead]",
                ));
            }
            let mut cursor = interp.iterate(iterable)?;
            while let Some(item) = cursor.next_value() {
                interp.tick()?;
                total = ops::binary(&interp.limits, BinOp::Add, &total, &item)?;
            }
            Ok(total)
        }
        Builtin::Abs => {
            args.check(1, 1)?;
            let value = args.required(0, "x")?;
            args.finish()?;
            match value {
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => {
                    let i = other.expect_int("abs() argument")?;
                    i.checked_abs().map(Value::Int).ok_or_else(|| {
                        SandboxError::runtime(RuntimeKind::OverflowError, "integer result out of range")
                    })
                }
            }
        }
        Builtin::Round => {
            args.check(1, 2)?;
            let value = args.required(0, "number")?;
            let digits = args.arg(1, "ndigits").filter(|d| !matches!(d, Value::None));
            args.finish()?;
            round(value, digits)
        }
        Builtin::Any | Builtin::All => {
            args.check(1, 1)?;
            let iterable = args.required(0, "iterable")?;
            args.finish()?;
            let want_any = builtin == Builtin::Any;
            let mut cursor = interp.iterate(iterable)?;
            while let Some(item) = cursor.next_value() {
                interp.tick()?;
                if item.truthy() == want_any {
                    return Ok(Value::Bool(want_any));
                }
            }
            Ok(Value::Bool(!want_any))
        }
        Builtin::Str => {
            args.check(0, 1)?;
            let value = args.arg(0, "object");
            args.finish()?;
            Ok(Value::str(value.map(|v| str_of(&v)).unwrap_or_default()))
        }
        Builtin::Repr => {
            args.check(1, 1)?;
            let value = args.required(0, "obj")?;
            args.finish()?;
            Ok(Value::str(repr(&value)))
        }
        Builtin::TypeName => {
            args.check(1, 1)?;
            let value = args.required(0, "obj")?;
            args.finish()?;
            Ok(Value::str(value.type_name()))
        }
        Builtin::Int => {
            args.check(0, 2)?;
            let value = args.arg(0, "x").unwrap_or(Value::Int(0));
            let base = args.arg(1, "base").map(|b| b.expect_int("int() base")).transpose()?;
            args.finish()?;
            to_int(&value, base)
        }
        Builtin::Float => {
            args.check(0, 1)?;
            let value = args.arg(0, "x").unwrap_or(Value::Float(0.0));
            args.finish()?;
            to_float(&value)
        }
        Builtin::Bool => {
            args.check(0, 1)?;
            let value = args.arg(0, "x");
            args.finish()?;
            Ok(Value::Bool(value.is_some_and(|v| v.truthy())))
        }
        Builtin::List | Builtin::Tuple | Builtin::Set => {
            args.check(0, 1)?;
            let value = args.arg(0, "iterable");
            args.finish()?;
            let items = match value {
                Some(value) => interp.collect(value)?,
                None => Vec::new(),
            };
            Ok(match builtin {
                Builtin::List => Value::list(items),
                Builtin::Tuple => Value::tuple(items),
                _ => Value::set(Table::from_keys(items)?),
            })
        }
        Builtin::Dict => {
            args.check(0, 1)?;
            let Args {
                positional,
                keywords,
                ..
            } = args;
            let mut table = Table::default();
            if let Some(source) = positional.into_iter().next() {
                if let Value::Dict(other) = &source {
                    for (key, value) in other.borrow().items() {
                        table.insert(key, value)?;
                    }
                } else {
                    for pair in interp.collect(source)? {
                        let pair = interp.collect(pair)?;
                        let [key, value]: [Value; 2] = pair.try_into().map_err(|_| {
                            SandboxError::value_error("dictionary update sequence element has wrong length")
                        })?;
                        table.insert(key, value)?;
                    }
                }
            }
            for (key, value) in keywords {
                table.insert(Value::str(key), value)?;
            }
            Ok(Value::dict(table))
        }
        Builtin::Print => {
            let sep = args.keyword("sep").map(|v| str_of(&v)).unwrap_or_else(|| " ".to_string());
            let end = args.keyword("end").map(|v| str_of(&v)).unwrap_or_else(|| "\n".to_string());
            let values = args.into_positional()?;
            let mut line = values.iter().map(str_of).collect::<Vec<_>>().join(&sep);
            line.push_str(&end);
            interp.output.push(&line);
            Ok(Value::None)
        }
        Builtin::Map => {
            args.check(2, usize::MAX)?;
            let mut positional = args.into_positional()?.into_iter();
            let func = positional.next().unwrap_or(Value::None);
            let mut columns = Vec::new();
            for iterable in positional {
                columns.push(interp.collect(iterable)?);
            }
            let len = columns.iter().map(Vec::len).min().unwrap_or(0);
            let mut out = Vec::with_capacity(len);
            for i in 0..len {
                let call_args = columns.iter().map(|c| c[i].clone()).collect();
                out.push(interp.call(func.clone(), call_args, Vec::new())?);
            }
            Ok(Value::list(out))
        }
        Builtin::Filter => {
            args.check(2, 2)?;
            let func = args.required(0, "function")?;
            let iterable = args.required(1, "iterable")?;
            args.finish()?;
            let mut out = Vec::new();
            for item in interp.collect(iterable)? {
                let keep = match &func {
                    Value::None => item.truthy(),
                    f => interp.call1(f, item.clone())?.truthy(),
                };
                if keep {
                    out.push(item);
                }
            }
            Ok(Value::list(out))
        }
    }
}

/// Stable sort with an optional key function. Comparison errors abort.
pub(crate) fn sort_values(
    interp: &mut Interp<'_>,
    items: Vec<Value>,
    key: Option<&Value>,
    reverse: bool,
) -> Result<Vec<Value>> {
    let mut keyed = Vec::with_capacity(items.len());
    for item in items {
        let sort_key = match key {
            Some(func) => interp.call1(func, item.clone())?,
            None => item.clone(),
        };
        keyed.push((sort_key, item));
    }
    let mut failure = None;
    keyed.sort_by(|(a, _), (b, _)| {
        let ordering = if reverse {
            ops::sort_order(b, a)
        } else {
            ops::sort_order(a, b)
        };
        ordering.unwrap_or_else(|err| {
            failure.get_or_insert(err);
            Ordering::Equal
        })
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(keyed.into_iter().map(|(_, item)| item).collect()),
    }
}

fn extreme(interp: &mut Interp<'_>, builtin: Builtin, mut args: Args) -> Result<Value> {
    args.check(1, usize::MAX)?;
    let key = args.keyword("key").filter(|k| !matches!(k, Value::None));
    let default = args.keyword("default");
    let positional = args.into_positional()?;
    let candidates = if positional.len() == 1 {
        let iterable = positional.into_iter().next().unwrap_or(Value::None);
        interp.collect(iterable)?
    } else {
        positional
    };

    let mut best: Option<(Value, Value)> = None;
    for item in candidates {
        let score = match &key {
            Some(func) => interp.call1(func, item.clone())?,
            None => item.clone(),
        };
        let replace = match &best {
            None => true,
            Some((best_score, _)) => {
                let ordering = ops::sort_order(&score, best_score)?;
                match builtin {
                    Builtin::Min => ordering == Ordering::Less,
                    _ => ordering == Ordering::Greater,
                }
            }
        };
        if replace {
            best = Some((score, item));
        }
    }
    match (best, default) {
        (Some((_, item)), _) => Ok(item),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(SandboxError::value_error(format!(
            "{}() arg is an empty sequence",
            builtin.name()
        ))),
    }
}

fn round(value: Value, digits: Option<Value>) -> Result<Value> {
    let digits = digits.map(|d| d.expect_int("ndigits")).transpose()?;
    match (value, digits) {
        (Value::Float(f), None) => {
            let rounded = f.round_ties_even();
            if !rounded.is_finite() || rounded.abs() >= 9.2e18 {
                return Err(SandboxError::runtime(
                    RuntimeKind::OverflowError,
                    "cannot convert float to integer",
                ));
            }
            Ok(Value::Int(rounded as i64))
        }
        (Value::Float(f), Some(n)) => {
            let factor = 10f64.powi(n.clamp(-308, 308) as i32);
            let rounded = (f * factor).round_ties_even() / factor;
            Ok(Value::Float(if rounded.is_finite() { rounded } else { f }))
        }
        (other, _) => Ok(Value::Int(other.expect_int("round() argument")?)),
    }
}

fn invalid_literal(what: &str, text: &str, base: u32) -> SandboxError {
    if what == "int" {
        SandboxError::value_error(format!(
            "invalid literal for int() with base {base}: {}",
            str_repr(text)
        ))
    } else {
        SandboxError::value_error(format!(
            "could not convert string to float: {}",
            str_repr(text)
        ))
    }
}

fn to_int(value: &Value, base: Option<i64>) -> Result<Value> {
    match value {
        Value::Str(text) => {
            let base = base.unwrap_or(10);
            if !(2..=36).contains(&base) {
                return Err(SandboxError::value_error("int() base must be >= 2 and <= 36"));
            }
            let base = base as u32;
            let trimmed = text.trim();
            let (negative, digits) = match trimmed.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
            };
            let digits = match base {
                16 => digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")).unwrap_or(digits),
                8 => digits.strip_prefix("0o").or_else(|| digits.strip_prefix("0O")).unwrap_or(digits),
                2 => digits.strip_prefix("0b").or_else(|| digits.strip_prefix("0B")).unwrap_or(digits),
                _ => digits,
            };
            if digits.is_empty() || digits.starts_with('_') || digits.ends_with('_') || digits.contains("__") {
                return Err(invalid_literal("int", text, base));
            }
            let cleaned: String = digits.chars().filter(|c| *c != '_').collect();
            let magnitude = i128::from_str_radix(&cleaned, base).map_err(|_| invalid_literal("int", text, base))?;
            let signed = if negative { -magnitude } else { magnitude };
            i64::try_from(signed).map(Value::Int).map_err(|_| {
                SandboxError::runtime(RuntimeKind::OverflowError, "integer result out of range")
            })
        }
        _ if base.is_some() => Err(SandboxError::type_error(
            "int() can't convert non-string with explicit base",
        )),
        Value::Float(f) => {
            if f.is_nan() {
                return Err(SandboxError::value_error("cannot convert float NaN to integer"));
            }
            let truncated = f.trunc();
            if !truncated.is_finite() || truncated.abs() >= 9.2e18 {
                return Err(SandboxError::runtime(
                    RuntimeKind::OverflowError,
                    "cannot convert float to integer",
                ));
            }
            Ok(Value::Int(truncated as i64))
        }
        other => other.as_int().map(Value::Int).ok_or_else(|| {
            SandboxError::type_error(format!(
                "int() argument must be a string or a number, not '{}'",
                other.type_name()
            ))
        }),
    }
}

fn to_float(value: &Value) -> Result<Value> {
    match value {
        Value::Str(text) => {
            let cleaned: String = text.trim().chars().filter(|c| *c != '_').collect();
            cleaned
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| invalid_literal("float", text, 10))
        }
        other => other.as_f64().map(Value::Float).ok_or_else(|| {
            SandboxError::type_error(format!(
                "float() argument must be a string or a number, not '{}'",
                other.type_name()
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::run;
    use super::*;
    use pretty_assertions::assert_eq;

    fn repr(source: &str) -> String {
        run(source).unwrap().repr
    }

    #[test]
    fn names_round_trip() {
        for builtin in Builtin::ALL {
            assert_eq!(Builtin::from_name(builtin.name()), Some(*builtin));
        }
        assert_eq!(Builtin::from_name("eval"), None);
        assert_eq!(Builtin::from_name("open"), None);
    }

    #[test]
    fn sequence_builtins() {
        assert_eq!(repr("len('héllo'), len([1, 2]), len(range(0, 10, 3))"), "(5, 2, 4)");
        assert_eq!(repr("list(enumerate('ab', 1))"), "[(1, 'a'), (2, 'b')]");
        assert_eq!(repr("list(zip([1, 2, 3], 'ab'))"), "[(1, 'a'), (2, 'b')]");
        assert_eq!(repr("list(reversed(range(3)))"), "[2, 1, 0]");
        assert_eq!(repr("list(map(lambda a, b: a * b, [1, 2], [3, 4]))"), "[3, 8]");
        assert_eq!(repr("list(filter(None, [0, 1, '', 'x']))"), "[1, 'x']");
    }

    #[test]
    fn sorting_is_stable_in_both_directions() {
        assert_eq!(
            repr("sorted([('b', 1), ('a', 2), ('b', 0)], key=lambda p: p[0])"),
            "[('a', 2), ('b', 1), ('b', 0)]"
        );
        assert_eq!(
            repr("sorted([('b', 1), ('a', 2), ('b', 0)], key=lambda p: p[0], reverse=True)"),
            "[('b', 1), ('b', 0), ('a', 2)]"
        );
        assert!(run("sorted([1, 'a'])").is_err());
    }

    #[test]
    fn reductions() {
        assert_eq!(repr("min(3, 1, 2), max([3, 1, 2]), max([], default=-1)"), "(1, 3, -1)");
        assert_eq!(repr("max(['aa', 'b', 'ccc'], key=len)"), "'ccc'");
        assert_eq!(repr("sum([1, 2, 3]), sum([0.5, 0.25])"), "(6, 0.75)");
        assert_eq!(repr("any([0, '', 3]), all([1, []])"), "(True, False)");
        assert!(run("min([])").is_err());
    }

    #[test]
    fn conversions() {
        assert_eq!(repr("int(' 42 '), int('-1_000'), int('ff', 16), int(3.9), int(-3.9)"), "(42, -1000, 255, 3, -3)");
        assert_eq!(repr("float('1.5'), float(2), str(1.0), bool([])"), "(1.5, 2.0, '1.0', False)");
        assert_eq!(repr("round(2.5), round(3.5), round(1.25, 1)"), "(2, 4, 1.2)");
        assert!(run("int('4.2')").is_err());
        assert_eq!(repr("dict([('a', 1)], b=2)"), "{'a': 1, 'b': 2}");
        assert_eq!(repr("sorted(set('abca'))"), "['a', 'b', 'c']");
        assert_eq!(repr("type_name(1), type_name('x'), type_name(len)"), "('int', 'str', 'builtin_function')");
    }
}
