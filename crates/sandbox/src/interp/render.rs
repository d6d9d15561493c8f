//! Python-style `repr`/`str` rendering and conversion to plain JSON.

use crate::value::Value;
use serde_json::json;

const MAX_DEPTH: usize = 32;

pub(crate) fn repr(value: &Value) -> String {
    let mut out = String::new();
    write_repr(&mut out, value, 0);
    out
}

/// `str(value)`: strings render raw, everything else as `repr`.
pub(crate) fn str_of(value: &Value) -> String {
    match value {
        Value::Str(s) => s.to_string(),
        other => repr(other),
    }
}

pub(crate) fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let scientific = format!("{f:e}");
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if (-4..16).contains(&exponent) {
        let plain = format!("{f}");
        if plain.contains('.') {
            plain
        } else {
            format!("{plain}.0")
        }
    } else {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    }
}

pub(crate) fn str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => out.push_str(&format!("\\x{:02x}", c as u32)),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn write_items<'a>(out: &mut String, items: impl Iterator<Item = &'a Value>, depth: usize) {
    for (i, item) in items.enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_repr(out, item, depth + 1);
    }
}

fn write_repr(out: &mut String, value: &Value, depth: usize) {
    if depth > MAX_DEPTH {
        out.push_str("...");
        return;
    }
    match value {
        Value::None => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) => out.push_str(&float_repr(*f)),
        Value::Str(s) => out.push_str(&str_repr(s)),
        Value::List(items) => {
            out.push('[');
            write_items(out, items.borrow().iter(), depth);
            out.push(']');
        }
        Value::Tuple(items) => {
            out.push('(');
            write_items(out, items.iter(), depth);
            if items.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        Value::Dict(table) => {
            out.push('{');
            for (i, (key, value)) in table.borrow().items().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_repr(out, key, depth + 1);
                out.push_str(": ");
                write_repr(out, value, depth + 1);
            }
            out.push('}');
        }
        Value::Set(table) => {
            let table = table.borrow();
            if table.is_empty() {
                out.push_str("set()");
                return;
            }
            out.push('{');
            write_items(out, table.keys().iter(), depth);
            out.push('}');
        }
        Value::Range(range) => {
            if range.step == 1 {
                out.push_str(&format!("range({}, {})", range.start, range.stop));
            } else {
                out.push_str(&format!("range({}, {}, {})", range.start, range.stop, range.step));
            }
        }
        Value::Lambda(_) => out.push_str("<function <lambda>>"),
        Value::Builtin(builtin) => out.push_str(&format!("<built-in function {}>", builtin.name())),
        Value::Helper(helper) => out.push_str(&format!("<built-in function {}>", helper.name())),
        Value::Method(bound) => out.push_str(&format!(
            "<built-in method {} of {} object>",
            bound.method.name(),
            bound.receiver.type_name()
        )),
    }
}

/// Plain JSON view of a result. Tuples and sets become arrays, dict keys
/// become strings, anything that is not data becomes its repr.
pub(crate) fn to_json(value: &Value) -> serde_json::Value {
    to_json_at(value, 0)
}

fn to_json_at(value: &Value, depth: usize) -> serde_json::Value {
    if depth > MAX_DEPTH {
        return json!("...");
    }
    match value {
        Value::None => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) if f.is_finite() => json!(f),
        Value::Str(s) => json!(&**s),
        Value::List(items) => array(items.borrow().iter(), depth),
        Value::Tuple(items) => array(items.iter(), depth),
        Value::Set(table) => array(table.borrow().keys().iter(), depth),
        Value::Dict(table) => {
            let mut map = serde_json::Map::new();
            for (key, value) in table.borrow().items() {
                map.insert(str_of(&key), to_json_at(&value, depth + 1));
            }
            serde_json::Value::Object(map)
        }
        other => json!(repr(other)),
    }
}

fn array<'a>(items: impl Iterator<Item = &'a Value>, depth: usize) -> serde_json::Value {
    serde_json::Value::Array(items.map(|item| to_json_at(item, depth + 1)).collect())
}
