//! f-strings, `str.format` and the format-spec mini language.
//!
//! Field names in `str.format` templates are data, so attribute parts go
//! through the run-time attribute gate before they are resolved.

use super::render::{float_repr, repr, str_of};
use super::{ops, Args, Interp};
use crate::ast::FPart;
use crate::error::{Result, SandboxError};
use crate::guard::check_attribute;
use crate::value::Value;

pub(crate) fn joined(interp: &mut Interp<'_>, parts: &[FPart]) -> Result<String> {
    let mut out = String::new();
    for part in parts {
        match part {
            FPart::Lit(text) => out.push_str(text),
            FPart::Field {
                expr,
                conversion,
                spec,
            } => {
                let value = interp.eval(expr)?;
                let value = convert(value, *conversion);
                out.push_str(&format_value(&value, spec, interp.limits.max_string_bytes)?);
            }
        }
        interp.check_str_len(out.len())?;
    }
    Ok(out)
}

fn convert(value: Value, conversion: Option<char>) -> Value {
    match conversion {
        Some('r') | Some('a') => Value::str(repr(&value)),
        Some('s') => Value::str(str_of(&value)),
        _ => value,
    }
}

/// `template.format(*args, **kwargs)`
pub(crate) fn format_method(interp: &mut Interp<'_>, template: &str, args: Args) -> Result<String> {
    let Args {
        positional,
        keywords,
        ..
    } = args;
    let mut out = String::new();
    let mut auto_index = 0usize;
    let mut chars = template.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                out.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(SandboxError::value_error("single '}' encountered in format string")),
            '{' => {
                let mut field = String::new();
                let mut closed = false;
                let mut nested = 0usize;
                for (_, c) in chars.by_ref() {
                    match c {
                        '{' => nested += 1,
                        '}' if nested == 0 => {
                            closed = true;
                            break;
                        }
                        '}' => nested -= 1,
                        _ => {}
                    }
                    field.push(c);
                }
                if !closed {
                    return Err(SandboxError::value_error("expected '}' before end of string"));
                }
                let (name, conversion, spec) = split_field(&field)?;
                let value = resolve_field(interp, name, &positional, &keywords, &mut auto_index)?;
                let value = convert(value, conversion);
                out.push_str(&format_value(&value, spec, interp.limits.max_string_bytes)?);
                interp.check_str_len(out.len())?;
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

fn split_field(field: &str) -> Result<(&str, Option<char>, &str)> {
    let (head, spec) = match field.find(':') {
        Some(i) => (&field[..i], &field[i + 1..]),
        None => (field, ""),
    };
    let (name, conversion) = match head.find('!') {
        Some(i) => {
            let conv = &head[i + 1..];
            let mut conv_chars = conv.chars();
            match (conv_chars.next(), conv_chars.next()) {
                (Some(c @ ('r' | 's' | 'a')), None) => (&head[..i], Some(c)),
                _ => return Err(SandboxError::value_error(format!("unknown conversion specifier {conv}"))),
            }
        }
        None => (head, None),
    };
    Ok((name, conversion, spec))
}

fn resolve_field(
    interp: &mut Interp<'_>,
    name: &str,
    positional: &[Value],
    keywords: &[(String, Value)],
    auto_index: &mut usize,
) -> Result<Value> {
    let end = name.find(['.', '[']).unwrap_or(name.len());
    let (first, mut rest) = name.split_at(end);

    let mut value = if first.is_empty() {
        let index = *auto_index;
        *auto_index += 1;
        positional_arg(positional, index)?
    } else if let Ok(index) = first.parse::<usize>() {
        positional_arg(positional, index)?
    } else {
        keywords
            .iter()
            .find(|(key, _)| key == first)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| SandboxError::runtime(crate::error::RuntimeKind::KeyError, format!("'{first}'")))?
    };

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after.find(['.', '[']).unwrap_or(after.len());
            let attr = &after[..end];
            check_attribute(attr)?;
            value = interp.attribute(value, attr)?;
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let close = after
                .find(']')
                .ok_or_else(|| SandboxError::value_error("missing ']' in format string"))?;
            let key = &after[..close];
            let key = match key.parse::<i64>() {
                Ok(i) => Value::Int(i),
                Err(_) => Value::str(key),
            };
            value = ops::get_item(&value, &key)?;
            rest = &after[close + 1..];
        } else {
            return Err(SandboxError::value_error("only '.' or '[' may follow ']' in format field specifier"));
        }
    }
    Ok(value)
}

fn positional_arg(positional: &[Value], index: usize) -> Result<Value> {
    positional.get(index).cloned().ok_or_else(|| {
        SandboxError::runtime(
            crate::error::RuntimeKind::IndexError,
            format!("Replacement index {index} out of range for positional args tuple"),
        )
    })
}

#[derive(Debug, Default, PartialEq)]
struct Spec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    alternate: bool,
    zero: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

fn invalid_spec(spec: &str) -> SandboxError {
    SandboxError::value_error(format!("Invalid format specifier '{spec}'"))
}

fn parse_spec(spec: &str) -> Result<Spec> {
    let chars: Vec<char> = spec.chars().collect();
    let mut parsed = Spec::default();
    let mut i = 0;
    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');

    if chars.len() >= 2 && is_align(chars[1]) {
        parsed.fill = Some(chars[0]);
        parsed.align = Some(chars[1]);
        i = 2;
    } else if chars.first().copied().is_some_and(is_align) {
        parsed.align = Some(chars[0]);
        i = 1;
    }
    if let Some(&c @ ('+' | '-' | ' ')) = chars.get(i) {
        parsed.sign = Some(c);
        i += 1;
    }
    if chars.get(i) == Some(&'#') {
        parsed.alternate = true;
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        parsed.zero = true;
        i += 1;
    }
    let digits_start = i;
    while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
        i += 1;
    }
    if i > digits_start {
        let digits: String = chars[digits_start..i].iter().collect();
        parsed.width = digits.parse().map_err(|_| invalid_spec(spec))?;
    }
    if let Some(&c @ (',' | '_')) = chars.get(i) {
        parsed.grouping = Some(c);
        i += 1;
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        let start = i;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        if i == start {
            return Err(invalid_spec(spec));
        }
        let digits: String = chars[start..i].iter().collect();
        parsed.precision = Some(digits.parse().map_err(|_| invalid_spec(spec))?);
    }
    if let Some(&c) = chars.get(i) {
        parsed.kind = Some(c);
        i += 1;
    }
    if i != chars.len() {
        return Err(invalid_spec(spec));
    }
    Ok(parsed)
}

fn unknown_code(kind: char, value: &Value) -> SandboxError {
    SandboxError::value_error(format!(
        "Unknown format code '{kind}' for object of type '{}'",
        value.type_name()
    ))
}

/// Apply a format spec to a value. `max_len` bounds the padded width.
pub(crate) fn format_value(value: &Value, spec: &str, max_len: usize) -> Result<String> {
    if spec.is_empty() {
        return Ok(str_of(value));
    }
    let spec = parse_spec(spec)?;
    if spec.width > max_len {
        return Err(SandboxError::resource(format!(
            "format width {} exceeds {max_len}",
            spec.width
        )));
    }

    let (sign, body, numeric) = match value {
        Value::Str(s) => {
            if !matches!(spec.kind, None | Some('s')) {
                return Err(unknown_code(spec.kind.unwrap_or('s'), value));
            }
            let text = match spec.precision {
                Some(p) => s.chars().take(p).collect(),
                None => s.to_string(),
            };
            (String::new(), text, false)
        }
        Value::Int(_) | Value::Bool(_) if !matches!(spec.kind, Some('f' | 'F' | 'e' | 'E' | 'g' | 'G' | '%')) => {
            let i = value.as_int().unwrap_or_default();
            let magnitude = i.unsigned_abs();
            let body = match spec.kind {
                None | Some('d') | Some('n') => group(&magnitude.to_string(), spec.grouping),
                Some('x') => prefixed(spec.alternate, "0x", format!("{magnitude:x}")),
                Some('X') => prefixed(spec.alternate, "0X", format!("{magnitude:X}")),
                Some('o') => prefixed(spec.alternate, "0o", format!("{magnitude:o}")),
                Some('b') => prefixed(spec.alternate, "0b", format!("{magnitude:b}")),
                Some(other) => return Err(unknown_code(other, value)),
            };
            (sign_for(i < 0, spec.sign), body, true)
        }
        Value::Int(_) | Value::Bool(_) | Value::Float(_) => {
            let f = value.as_f64().unwrap_or_default();
            let body = float_body(f.abs(), &spec).ok_or_else(|| unknown_code(spec.kind.unwrap_or('f'), value))?;
            (sign_for(f.is_sign_negative() && !f.is_nan(), spec.sign), body, true)
        }
        other => {
            return Err(SandboxError::type_error(format!(
                "unsupported format string passed to {}.__format__",
                other.type_name()
            )))
        }
    };
    Ok(pad(sign, body, numeric, &spec))
}

fn prefixed(alternate: bool, prefix: &str, digits: String) -> String {
    if alternate {
        format!("{prefix}{digits}")
    } else {
        digits
    }
}

fn sign_for(negative: bool, sign: Option<char>) -> String {
    match (negative, sign) {
        (true, _) => "-".to_string(),
        (false, Some('+')) => "+".to_string(),
        (false, Some(' ')) => " ".to_string(),
        _ => String::new(),
    }
}

fn group(digits: &str, separator: Option<char>) -> String {
    let Some(separator) = separator else {
        return digits.to_string();
    };
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(separator);
        }
        out.push(c);
    }
    out
}

fn group_float(text: String, separator: Option<char>) -> String {
    if separator.is_none() {
        return text;
    }
    let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    let (int_part, rest) = text.split_at(split);
    format!("{}{rest}", group(int_part, separator))
}

fn exponent_form(f: f64, precision: usize, upper: bool) -> String {
    let raw = format!("{f:.precision$e}");
    let (mantissa, exponent) = raw.split_once('e').unwrap_or((&raw, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if exponent < 0 { '-' } else { '+' };
    let e = if upper { 'E' } else { 'e' };
    format!("{mantissa}{e}{sign}{:02}", exponent.abs())
}

fn strip_zeros(text: String) -> String {
    match text.split_once(['e', 'E']) {
        Some((mantissa, exponent)) if mantissa.contains('.') => {
            let e = &text[mantissa.len()..mantissa.len() + 1];
            format!("{}{e}{exponent}", mantissa.trim_end_matches('0').trim_end_matches('.'))
        }
        None if text.contains('.') => text.trim_end_matches('0').trim_end_matches('.').to_string(),
        _ => text,
    }
}

/// Magnitude of a float per the spec's presentation type.
fn float_body(f: f64, spec: &Spec) -> Option<String> {
    if f.is_nan() {
        return Some("nan".to_string());
    }
    if f.is_infinite() {
        return Some("inf".to_string());
    }
    let text = match spec.kind {
        Some('f') | Some('F') => {
            let p = spec.precision.unwrap_or(6);
            group_float(format!("{f:.p$}"), spec.grouping)
        }
        Some('e') | Some('E') => exponent_form(f, spec.precision.unwrap_or(6), spec.kind == Some('E')),
        Some('%') => {
            let p = spec.precision.unwrap_or(6);
            format!("{}%", group_float(format!("{:.p$}", f * 100.0), spec.grouping))
        }
        Some('g') | Some('G') => general(f, spec.precision.unwrap_or(6), spec.kind == Some('G')),
        None => match spec.precision {
            Some(p) => general(f, p.max(1), false),
            None => group_float(float_repr(f), spec.grouping),
        },
        Some(_) => return None,
    };
    Some(text)
}

fn general(f: f64, precision: usize, upper: bool) -> String {
    let precision = precision.max(1);
    if f == 0.0 {
        return "0".to_string();
    }
    let exponent = f.log10().floor() as i64;
    if exponent >= -4 && exponent < precision as i64 {
        let decimals = (precision as i64 - 1 - exponent).max(0) as usize;
        strip_zeros(format!("{f:.decimals$}"))
    } else {
        strip_zeros(exponent_form(f, precision - 1, upper))
    }
}

fn pad(sign: String, body: String, numeric: bool, spec: &Spec) -> String {
    let (fill, align) = match (spec.align, spec.zero && numeric) {
        (Some(align), _) => (spec.fill.unwrap_or(' '), align),
        (None, true) => ('0', '='),
        (None, false) => (' ', if numeric { '>' } else { '<' }),
    };
    let len = sign.chars().count() + body.chars().count();
    let missing = spec.width.saturating_sub(len);
    let fill_str = |n: usize| std::iter::repeat(fill).take(n).collect::<String>();
    match align {
        '<' => format!("{sign}{body}{}", fill_str(missing)),
        '^' => format!(
            "{}{sign}{body}{}",
            fill_str(missing / 2),
            fill_str(missing - missing / 2)
        ),
        '=' => format!("{sign}{}{body}", fill_str(missing)),
        _ => format!("{}{sign}{body}", fill_str(missing)),
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::run;
    use super::*;
    use pretty_assertions::assert_eq;

    fn fmt(value: Value, spec: &str) -> String {
        format_value(&value, spec, 1 << 20).unwrap()
    }

    #[test]
    fn numeric_specs() {
        assert_eq!(fmt(Value::Float(3.14159), ".2f"), "3.14");
        assert_eq!(fmt(Value::Int(42), "05d"), "00042");
        assert_eq!(fmt(Value::Int(-42), "+6"), "   -42");
        assert_eq!(fmt(Value::Int(1234567), ","), "1,234,567");
        assert_eq!(fmt(Value::Int(255), "#x"), "0xff");
        assert_eq!(fmt(Value::Float(0.25), ".1%"), "25.0%");
        assert_eq!(fmt(Value::Float(12345.678), ".3e"), "1.235e+04");
        assert_eq!(fmt(Value::Float(0.0001234), "g"), "0.0001234");
        assert_eq!(fmt(Value::Int(7), ".2f"), "7.00");
    }

    #[test]
    fn text_alignment() {
        assert_eq!(fmt(Value::str("ab"), ">5"), "   ab");
        assert_eq!(fmt(Value::str("ab"), "*^6"), "**ab**");
        assert_eq!(fmt(Value::str("abcdef"), ".3"), "abc");
        assert!(format_value(&Value::str("a"), "d", 100).is_err());
        assert!(format_value(&Value::str("a"), "999999", 100).is_err());
    }

    #[test]
    fn fstrings_and_format_method() {
        let out = run("name = 'x'\nn = 3\nf'{name!r} has {n:>3} items, {n * 2}'").unwrap();
        assert_eq!(out.repr, "\"'x' has   3 items, 6\"");
        let out = run("'{} and {} {k}'.format('a', 'b', k='c')").unwrap();
        assert_eq!(out.repr, "'a and b c'");
        let out = run("'{0[1]} {0[0]}'.format(['x', 'y'])").unwrap();
        assert_eq!(out.repr, "'y x'");
        let out = run("'{{literal}}'.format()").unwrap();
        assert_eq!(out.repr, "'{literal}'");
    }

    #[test]
    fn format_fields_are_attribute_gated() {
        let err = run("('{0.__cl' + 'ass__}').format(1)").unwrap_err();
        assert!(
            matches!(err, SandboxError::ForbiddenAttribute { ref name, .. } if name == "__class__"),
            "{err:?}"
        );
        let err = run("'{0.mro}'.format(1)").unwrap_err();
        assert!(matches!(err, SandboxError::ForbiddenAttribute { .. }));
    }
}
