//! Operators, comparisons, indexing and slicing with Python semantics over
//! checked 64-bit integers.

use super::render::repr;
use crate::ast::{BinOp, CmpOp, UnaryOp};
use crate::config::EvalLimits;
use crate::error::{Result, RuntimeKind, SandboxError};
use crate::value::{RangeValue, Table, Value};
use std::cmp::Ordering;
use std::rc::Rc;

const MAX_COMPARE_DEPTH: usize = 64;

enum Num {
    Ints(i64, i64),
    Floats(f64, f64),
}

fn numbers(left: &Value, right: &Value) -> Option<Num> {
    match (left.as_int(), right.as_int()) {
        (Some(a), Some(b)) => Some(Num::Ints(a, b)),
        _ => Some(Num::Floats(left.as_f64()?, right.as_f64()?)),
    }
}

fn overflow() -> SandboxError {
    SandboxError::runtime(RuntimeKind::OverflowError, "integer result out of range")
}

fn zero_division(what: &str) -> SandboxError {
    SandboxError::runtime(RuntimeKind::ZeroDivisionError, what.to_string())
}

fn unsupported(op: BinOp, left: &Value, right: &Value) -> SandboxError {
    SandboxError::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

pub(crate) fn floor_div(a: i64, b: i64) -> Result<i64> {
    if b == 0 {
        return Err(zero_division("integer division or modulo by zero"));
    }
    let q = a.checked_div(b).ok_or_else(overflow)?;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

pub(crate) fn modulo(a: i64, b: i64) -> Result<i64> {
    if b == 0 {
        return Err(zero_division("integer division or modulo by zero"));
    }
    let r = a.checked_rem(b).unwrap_or(0);
    if r != 0 && ((r < 0) != (b < 0)) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

fn repeat_count(value: &Value) -> Option<i64> {
    match value {
        Value::Int(_) | Value::Bool(_) => value.as_int(),
        _ => None,
    }
}

fn repeated_len(len: usize, times: i64, cap: usize, what: &str) -> Result<usize> {
    let times = usize::try_from(times.max(0)).unwrap_or(usize::MAX);
    match len.checked_mul(times) {
        Some(total) if total <= cap => Ok(total),
        _ => Err(SandboxError::resource(format!("{what} would exceed {cap}"))),
    }
}

pub(crate) fn binary(limits: &EvalLimits, op: BinOp, left: &Value, right: &Value) -> Result<Value> {
    match op {
        BinOp::Add => add(limits, left, right),
        BinOp::Mul => multiply(limits, left, right),
        BinOp::Sub => match (left, right) {
            (Value::Set(a), Value::Set(b)) => Ok(Value::set(difference(&a.borrow(), &b.borrow())?)),
            _ => arithmetic(op, left, right),
        },
        BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor => match (left, right) {
            (Value::Set(a), Value::Set(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                let table = match op {
                    BinOp::BitAnd => intersection(&a, &b)?,
                    BinOp::BitOr => union(&a, &b)?,
                    _ => {
                        let mut out = difference(&a, &b)?;
                        for key in difference(&b, &a)?.keys() {
                            out.insert(key, Value::None)?;
                        }
                        out
                    }
                };
                Ok(Value::set(table))
            }
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(match op {
                BinOp::BitAnd => a & b,
                BinOp::BitOr => a | b,
                _ => a ^ b,
            })),
            _ => arithmetic(op, left, right),
        },
        _ => arithmetic(op, left, right),
    }
}

fn add(limits: &EvalLimits, left: &Value, right: &Value) -> Result<Value> {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => {
            let len = a.len() + b.len();
            if len > limits.max_string_bytes {
                return Err(SandboxError::resource(format!(
                    "string of {len} bytes exceeds {}",
                    limits.max_string_bytes
                )));
            }
            let mut out = String::with_capacity(len);
            out.push_str(a);
            out.push_str(b);
            Ok(Value::str(out))
        }
        (Value::List(a), Value::List(b)) => {
            let mut out = a.borrow().clone();
            out.extend(b.borrow().iter().cloned());
            if out.len() > limits.max_container_len {
                return Err(SandboxError::resource(format!(
                    "container length exceeds {}",
                    limits.max_container_len
                )));
            }
            Ok(Value::list(out))
        }
        (Value::Tuple(a), Value::Tuple(b)) => {
            let mut out = (**a).clone();
            out.extend(b.iter().cloned());
            Ok(Value::tuple(out))
        }
        _ => arithmetic(BinOp::Add, left, right),
    }
}

fn multiply(limits: &EvalLimits, left: &Value, right: &Value) -> Result<Value> {
    let (sequence, times) = match (repeat_count(left), repeat_count(right)) {
        (_, Some(n)) if !matches!(left, Value::Int(_) | Value::Bool(_) | Value::Float(_)) => (left, n),
        (Some(n), _) if !matches!(right, Value::Int(_) | Value::Bool(_) | Value::Float(_)) => (right, n),
        _ => return arithmetic(BinOp::Mul, left, right),
    };
    match sequence {
        Value::Str(s) => {
            repeated_len(s.len(), times, limits.max_string_bytes, "string repetition")?;
            Ok(Value::str(s.repeat(times.max(0) as usize)))
        }
        Value::List(items) => {
            let items = items.borrow();
            repeated_len(items.len(), times, limits.max_container_len, "list repetition")?;
            Ok(Value::list(repeat_items(&items, times)))
        }
        Value::Tuple(items) => {
            repeated_len(items.len(), times, limits.max_container_len, "tuple repetition")?;
            Ok(Value::tuple(repeat_items(items, times)))
        }
        _ => Err(unsupported(BinOp::Mul, left, right)),
    }
}

fn repeat_items(items: &[Value], times: i64) -> Vec<Value> {
    let times = times.max(0) as usize;
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend(items.iter().cloned());
    }
    out
}

fn arithmetic(op: BinOp, left: &Value, right: &Value) -> Result<Value> {
    let Some(num) = numbers(left, right) else {
        return Err(unsupported(op, left, right));
    };
    match num {
        Num::Ints(a, b) => int_op(op, a, b).map_err(|err| match err {
            SandboxError::Runtime {
                error: RuntimeKind::TypeError,
                ..
            } => unsupported(op, left, right),
            other => other,
        }),
        Num::Floats(a, b) => float_op(op, a, b).map_err(|err| match err {
            SandboxError::Runtime {
                error: RuntimeKind::TypeError,
                ..
            } => unsupported(op, left, right),
            other => other,
        }),
    }
}

fn int_op(op: BinOp, a: i64, b: i64) -> Result<Value> {
    let value = match op {
        BinOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinOp::Div => {
            if b == 0 {
                return Err(zero_division("division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinOp::FloorDiv => floor_div(a, b)?,
        BinOp::Mod => modulo(a, b)?,
        BinOp::Pow => {
            if b < 0 {
                if a == 0 {
                    return Err(zero_division("0 cannot be raised to a negative power"));
                }
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            let exp = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exp).ok_or_else(overflow)?
        }
        BinOp::LShift | BinOp::RShift => {
            if b < 0 {
                return Err(SandboxError::value_error("negative shift count"));
            }
            if op == BinOp::RShift {
                if b >= 64 {
                    if a < 0 {
                        -1
                    } else {
                        0
                    }
                } else {
                    a >> b
                }
            } else {
                if a == 0 {
                    return Ok(Value::Int(0));
                }
                if b >= 63 {
                    return Err(overflow());
                }
                let shifted = a << b;
                if shifted >> b != a {
                    return Err(overflow());
                }
                shifted
            }
        }
        BinOp::BitAnd => a & b,
        BinOp::BitOr => a | b,
        BinOp::BitXor => a ^ b,
        BinOp::MatMul => return Err(SandboxError::type_error("@")),
    };
    Ok(Value::Int(value))
}

fn float_op(op: BinOp, a: f64, b: f64) -> Result<Value> {
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(zero_division("float division by zero"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(zero_division("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(zero_division("float modulo"));
            }
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
                r + b
            } else {
                r
            }
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(zero_division("0.0 cannot be raised to a negative power"));
            }
            a.powf(b)
        }
        _ => return Err(SandboxError::type_error(op.symbol())),
    };
    Ok(Value::Float(value))
}

pub(crate) fn unary(op: UnaryOp, value: &Value) -> Result<Value> {
    let bad = || {
        let symbol = match op {
            UnaryOp::Neg => "-",
            UnaryOp::Pos => "+",
            UnaryOp::Invert => "~",
            UnaryOp::Not => "not",
        };
        SandboxError::type_error(format!(
            "bad operand type for unary {symbol}: '{}'",
            value.type_name()
        ))
    };
    match (op, value) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy())),
        (_, Value::Float(f)) => match op {
            UnaryOp::Neg => Ok(Value::Float(-f)),
            UnaryOp::Pos => Ok(Value::Float(*f)),
            _ => Err(bad()),
        },
        (_, v) => {
            let i = v.as_int().ok_or_else(bad)?;
            match op {
                UnaryOp::Neg => Ok(Value::Int(i.checked_neg().ok_or_else(overflow)?)),
                UnaryOp::Pos => Ok(Value::Int(i)),
                _ => Ok(Value::Int(!i)),
            }
        }
    }
}

pub(crate) fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool> {
    Ok(match op {
        CmpOp::Eq => equal(left, right),
        CmpOp::NotEq => !equal(left, right),
        CmpOp::Lt => order(left, right)? == Some(Ordering::Less),
        CmpOp::LtE => matches!(order(left, right)?, Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => order(left, right)? == Some(Ordering::Greater),
        CmpOp::GtE => matches!(order(left, right)?, Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::In => contains(right, left)?,
        CmpOp::NotIn => !contains(right, left)?,
        CmpOp::Is => identical(left, right),
        CmpOp::IsNot => !identical(left, right),
    })
}

fn identical(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a == b,
        (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
        (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
        (Value::Dict(a), Value::Dict(b)) | (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b),
        (Value::Lambda(a), Value::Lambda(b)) => Rc::ptr_eq(a, b),
        (Value::Builtin(a), Value::Builtin(b)) => a == b,
        (Value::Helper(a), Value::Helper(b)) => a == b,
        _ => false,
    }
}

pub(crate) fn equal(left: &Value, right: &Value) -> bool {
    equal_at(left, right, 0)
}

fn equal_at(left: &Value, right: &Value, depth: usize) -> bool {
    if depth > MAX_COMPARE_DEPTH {
        return false;
    }
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::List(a), Value::List(b)) => {
            Rc::ptr_eq(a, b) || sequence_equal(&a.borrow(), &b.borrow(), depth)
        }
        (Value::Tuple(a), Value::Tuple(b)) => sequence_equal(a, b, depth),
        (Value::Dict(a), Value::Dict(b)) => {
            let (a, b) = (a.borrow(), b.borrow());
            a.len() == b.len()
                && a.items().iter().all(|(key, value)| match b.get(key) {
                    Ok(Some(other)) => equal_at(value, &other, depth + 1),
                    _ => false,
                })
        }
        (Value::Set(a), Value::Set(b)) => {
            let (a, b) = (a.borrow(), b.borrow());
            a.len() == b.len() && a.keys().iter().all(|key| b.contains(key).unwrap_or(false))
        }
        (Value::Range(a), Value::Range(b)) => {
            a.len() == b.len() && (a.len() == 0 || (a.start == b.start && (a.len() == 1 || a.step == b.step)))
        }
        (Value::Method(_), Value::Method(_)) => false,
        (a, b) => match numbers(a, b) {
            Some(Num::Ints(x, y)) => x == y,
            Some(Num::Floats(x, y)) => x == y,
            None => identical(a, b),
        },
    }
}

fn sequence_equal(a: &[Value], b: &[Value], depth: usize) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| equal_at(x, y, depth + 1))
}

/// Python ordering. `None` means unordered (NaN involved).
pub(crate) fn order(left: &Value, right: &Value) -> Result<Option<Ordering>> {
    order_at(left, right, 0)
}

fn order_at(left: &Value, right: &Value, depth: usize) -> Result<Option<Ordering>> {
    if depth > MAX_COMPARE_DEPTH {
        return Err(SandboxError::resource("comparison nesting too deep"));
    }
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
        (Value::List(a), Value::List(b)) => sequence_order(&a.borrow(), &b.borrow(), depth),
        (Value::Tuple(a), Value::Tuple(b)) => sequence_order(a, b, depth),
        (a, b) => match numbers(a, b) {
            Some(Num::Ints(x, y)) => Ok(Some(x.cmp(&y))),
            Some(Num::Floats(x, y)) => Ok(x.partial_cmp(&y)),
            None => Err(SandboxError::type_error(format!(
                "'<' not supported between instances of '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ))),
        },
    }
}

fn sequence_order(a: &[Value], b: &[Value], depth: usize) -> Result<Option<Ordering>> {
    for (x, y) in a.iter().zip(b) {
        if !equal_at(x, y, depth + 1) {
            return order_at(x, y, depth + 1);
        }
    }
    Ok(Some(a.len().cmp(&b.len())))
}

/// Total order for sorting: unordered pairs compare equal.
pub(crate) fn sort_order(left: &Value, right: &Value) -> Result<Ordering> {
    Ok(order(left, right)?.unwrap_or(Ordering::Equal))
}

pub(crate) fn contains(container: &Value, item: &Value) -> Result<bool> {
    match container {
        Value::Str(haystack) => match item {
            Value::Str(needle) => Ok(haystack.contains(&**needle)),
            other => Err(SandboxError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => Ok(items.borrow().iter().any(|v| equal(v, item))),
        Value::Tuple(items) => Ok(items.iter().any(|v| equal(v, item))),
        Value::Dict(table) | Value::Set(table) => match table.borrow().contains(item) {
            Ok(found) => Ok(found),
            Err(_) => Ok(false),
        },
        Value::Range(range) => Ok(range_contains(range, item)),
        other => Err(SandboxError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn range_contains(range: &RangeValue, item: &Value) -> bool {
    let Some(x) = item.as_int().or_else(|| match item {
        Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
        _ => None,
    }) else {
        return false;
    };
    let (x, start, stop, step) = (x as i128, range.start as i128, range.stop as i128, range.step as i128);
    let inside = if step > 0 {
        start <= x && x < stop
    } else {
        stop < x && x <= start
    };
    inside && (x - start) % step == 0
}

fn normalize_index(index: i64, len: usize, what: &str) -> Result<usize> {
    let len_i = len as i64;
    let adjusted = if index < 0 { index + len_i } else { index };
    if adjusted < 0 || adjusted >= len_i {
        return Err(SandboxError::runtime(
            RuntimeKind::IndexError,
            format!("{what} index out of range"),
        ));
    }
    Ok(adjusted as usize)
}

fn index_of(key: &Value, container: &Value) -> Result<i64> {
    key.as_int().ok_or_else(|| {
        SandboxError::type_error(format!(
            "{} indices must be integers, not '{}'",
            container.type_name(),
            key.type_name()
        ))
    })
}

pub(crate) fn get_item(container: &Value, key: &Value) -> Result<Value> {
    match container {
        Value::List(items) => {
            let items = items.borrow();
            let i = normalize_index(index_of(key, container)?, items.len(), "list")?;
            Ok(items[i].clone())
        }
        Value::Tuple(items) => {
            let i = normalize_index(index_of(key, container)?, items.len(), "tuple")?;
            Ok(items[i].clone())
        }
        Value::Str(text) => {
            let index = index_of(key, container)?;
            if text.is_ascii() {
                let i = normalize_index(index, text.len(), "string")?;
                return Ok(Value::str(&text[i..i + 1]));
            }
            let count = text.chars().count();
            let i = normalize_index(index, count, "string")?;
            let c = text.chars().nth(i).unwrap_or_default();
            Ok(Value::str(c.to_string()))
        }
        Value::Range(range) => {
            let i = normalize_index(index_of(key, container)?, range.len(), "range object")?;
            range.get(i).map(Value::Int).ok_or_else(overflow)
        }
        Value::Dict(table) => match table.borrow().get(key)? {
            Some(value) => Ok(value),
            None => Err(SandboxError::runtime(RuntimeKind::KeyError, repr(key))),
        },
        other => Err(SandboxError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub(crate) fn set_item(container: &Value, key: Value, value: Value) -> Result<()> {
    match container {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = normalize_index(index_of(&key, container)?, items.len(), "list assignment")?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(table) => table.borrow_mut().insert(key, value),
        other => Err(SandboxError::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

fn slice_bound(value: Option<Value>, what: &str) -> Result<Option<i64>> {
    match value {
        None | Some(Value::None) => Ok(None),
        Some(v) => v.as_int().map(Some).ok_or_else(|| {
            SandboxError::type_error(format!(
                "slice {what} must be an integer or None, not '{}'",
                v.type_name()
            ))
        }),
    }
}

/// Indices selected by `[lower:upper:step]` on a sequence of `len` items.
pub(crate) fn slice_indices(
    len: usize,
    lower: Option<Value>,
    upper: Option<Value>,
    step: Option<Value>,
) -> Result<Vec<usize>> {
    let step = slice_bound(step, "step")?.unwrap_or(1);
    if step == 0 {
        return Err(SandboxError::value_error("slice step cannot be zero"));
    }
    let len = len as i64;
    let adjust = |v: i64, low: i64, high: i64| {
        if v < 0 {
            (v + len).max(low)
        } else {
            v.min(high)
        }
    };
    let mut out = Vec::new();
    if step > 0 {
        let start = slice_bound(lower, "start")?.map_or(0, |v| adjust(v, 0, len));
        let stop = slice_bound(upper, "stop")?.map_or(len, |v| adjust(v, 0, len));
        let mut i = start;
        while i < stop {
            out.push(i as usize);
            i += step;
        }
    } else {
        let start = slice_bound(lower, "start")?.map_or(len - 1, |v| adjust(v, -1, len - 1));
        let stop = slice_bound(upper, "stop")?.map_or(-1, |v| adjust(v, -1, len - 1));
        let mut i = start;
        while i > stop {
            out.push(i as usize);
            i += step;
        }
    }
    Ok(out)
}

pub(crate) fn get_slice(
    container: &Value,
    lower: Option<Value>,
    upper: Option<Value>,
    step: Option<Value>,
) -> Result<Value> {
    match container {
        Value::List(items) => {
            let items = items.borrow();
            let picked = slice_indices(items.len(), lower, upper, step)?;
            Ok(Value::list(picked.into_iter().map(|i| items[i].clone()).collect()))
        }
        Value::Tuple(items) => {
            let picked = slice_indices(items.len(), lower, upper, step)?;
            Ok(Value::tuple(picked.into_iter().map(|i| items[i].clone()).collect()))
        }
        Value::Str(text) => {
            if text.is_ascii() {
                let bytes = text.as_bytes();
                let picked = slice_indices(bytes.len(), lower, upper, step)?;
                let out: String = picked.into_iter().map(|i| bytes[i] as char).collect();
                return Ok(Value::str(out));
            }
            let chars: Vec<char> = text.chars().collect();
            let picked = slice_indices(chars.len(), lower, upper, step)?;
            Ok(Value::str(picked.into_iter().map(|i| chars[i]).collect::<String>()))
        }
        Value::Range(range) => {
            let picked = slice_indices(range.len(), lower, upper, step)?;
            let items = picked
                .into_iter()
                .map(|i| range.get(i).map(Value::Int).ok_or_else(overflow))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::list(items))
        }
        other => Err(SandboxError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub(crate) fn union(a: &Table, b: &Table) -> Result<Table> {
    let mut out = a.clone();
    for key in b.keys() {
        out.insert(key, Value::None)?;
    }
    Ok(out)
}

pub(crate) fn intersection(a: &Table, b: &Table) -> Result<Table> {
    let mut out = Table::default();
    for key in a.keys() {
        if b.contains(&key)? {
            out.insert(key, Value::None)?;
        }
    }
    Ok(out)
}

pub(crate) fn difference(a: &Table, b: &Table) -> Result<Table> {
    let mut out = Table::default();
    for key in a.keys() {
        if !b.contains(&key)? {
            out.insert(key, Value::None)?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::super::tests::run;
    use crate::error::{RuntimeKind, SandboxError};
    use pretty_assertions::assert_eq;

    fn repr(source: &str) -> String {
        run(source).unwrap().repr
    }

    fn runtime_kind(source: &str) -> RuntimeKind {
        match run(source).unwrap_err() {
            SandboxError::Runtime { error, .. } => error,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn integer_division_floors_toward_negative_infinity() {
        assert_eq!(repr("(-7 // 2, -7 % 2, 7 // -2, 7 % -2)"), "(-4, 1, -4, -1)");
        assert_eq!(repr("-7.5 // 2"), "-4.0");
        assert_eq!(repr("7 / 2"), "3.5");
    }

    #[test]
    fn integer_overflow_is_an_error() {
        assert_eq!(runtime_kind("9223372036854775807 + 1"), RuntimeKind::OverflowError);
        assert_eq!(runtime_kind("2 ** 64"), RuntimeKind::OverflowError);
        assert_eq!(runtime_kind("1 << 70"), RuntimeKind::OverflowError);
        assert_eq!(repr("2 ** 62"), "4611686018427387904");
    }

    #[test]
    fn mixed_operand_errors() {
        assert_eq!(runtime_kind("'a' + 1"), RuntimeKind::TypeError);
        assert_eq!(runtime_kind("1 / 0"), RuntimeKind::ZeroDivisionError);
        assert_eq!(runtime_kind("[1][3]"), RuntimeKind::IndexError);
        assert_eq!(runtime_kind("{'a': 1}['b']"), RuntimeKind::KeyError);
    }

    #[test]
    fn sequences_and_sets() {
        assert_eq!(repr("'ab' * 3"), "'ababab'");
        assert_eq!(repr("[0] * 3 + [1]"), "[0, 0, 0, 1]");
        assert_eq!(repr("sorted({1, 2, 3} & {2, 3, 4})"), "[2, 3]");
        assert_eq!(repr("sorted({1, 2} | {3})"), "[1, 2, 3]");
        assert_eq!(repr("sorted({1, 2, 3} - {2})"), "[1, 3]");
    }

    #[test]
    fn comparisons_chain_and_contain() {
        assert_eq!(repr("1 < 2 < 3"), "True");
        assert_eq!(repr("1 < 3 < 2"), "False");
        assert_eq!(repr("'ell' in 'hello'"), "True");
        assert_eq!(repr("4 in range(0, 10, 2)"), "True");
        assert_eq!(repr("5 in range(0, 10, 2)"), "False");
        assert_eq!(repr("(1, 'b') < (1, 'c')"), "True");
        assert_eq!(repr("1 == 1.0 and [1, 2] == [1, 2] and None is None"), "True");
        assert_eq!(runtime_kind("1 < 'a'"), RuntimeKind::TypeError);
    }

    #[test]
    fn slicing_follows_python_bounds() {
        assert_eq!(repr("[0, 1, 2, 3, 4][1:-1]"), "[1, 2, 3]");
        assert_eq!(repr("[0, 1, 2, 3, 4][::-2]"), "[4, 2, 0]");
        assert_eq!(repr("'hello'[-3:]"), "'llo'");
        assert_eq!(repr("'héllo'[1:3]"), "'él'");
        assert_eq!(repr("'abc'[10:]"), "''");
        assert_eq!(repr("range(10)[2:5]"), "[2, 3, 4]");
        assert_eq!(runtime_kind("[1][::0]"), RuntimeKind::ValueError);
    }
}
