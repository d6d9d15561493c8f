//! Methods on built-in value types. A method is resolved by receiver type
//! and name into a [`Method`] variant; nothing else is reachable through an
//! attribute.

use super::builtins::sort_values;
use super::format::format_method;
use super::{ops, Args, Interp};
use crate::error::{Result, RuntimeKind, SandboxError};
use crate::value::{Table, Value};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    // str
    Lower,
    Upper,
    Strip,
    Lstrip,
    Rstrip,
    Split,
    Splitlines,
    Join,
    Replace,
    Startswith,
    Endswith,
    Find,
    StrCount,
    Format,
    Isdigit,
    Isalpha,
    Isalnum,
    Isspace,
    // list
    Append,
    Extend,
    ListPop,
    Insert,
    ListIndex,
    ListCount,
    Sort,
    Reverse,
    ListCopy,
    ListClear,
    Remove,
    // dict
    Get,
    Keys,
    Values,
    Items,
    DictPop,
    Update,
    Setdefault,
    DictCopy,
    DictClear,
    Popitem,
    // set
    Add,
    Discard,
    SetCopy,
    Union,
    Intersection,
    Difference,
    // tuple
    TupleCount,
    TupleIndex,
}

impl Method {
    pub fn resolve(receiver: &Value, name: &str) -> Option<Method> {
        use Method::*;
        let method = match receiver {
            Value::Str(_) => match name {
                "lower" => Lower,
                "upper" => Upper,
                "strip" => Strip,
                "lstrip" => Lstrip,
                "rstrip" => Rstrip,
                "split" => Split,
                "splitlines" => Splitlines,
                "join" => Join,
                "replace" => Replace,
                "startswith" => Startswith,
                "endswith" => Endswith,
                "find" => Find,
                "count" => StrCount,
                "format" => Format,
                "isdigit" => Isdigit,
                "isalpha" => Isalpha,
                "isalnum" => Isalnum,
                "isspace" => Isspace,
                _ => return None,
            },
            Value::List(_) => match name {
                "append" => Append,
                "extend" => Extend,
                "pop" => ListPop,
                "insert" => Insert,
                "index" => ListIndex,
                "count" => ListCount,
                "sort" => Sort,
                "reverse" => Reverse,
                "copy" => ListCopy,
                "clear" => ListClear,
                "remove" => Remove,
                _ => return None,
            },
            Value::Dict(_) => match name {
                "get" => Get,
                "keys" => Keys,
                "values" => Values,
                "items" => Items,
                "pop" => DictPop,
                "update" => Update,
                "setdefault" => Setdefault,
                "copy" => DictCopy,
                "clear" => DictClear,
                "popitem" => Popitem,
                _ => return None,
            },
            Value::Set(_) => match name {
                "add" => Add,
                "discard" => Discard,
                "copy" => SetCopy,
                "union" => Union,
                "intersection" => Intersection,
                "difference" => Difference,
                _ => return None,
            },
            Value::Tuple(_) => match name {
                "count" => TupleCount,
                "index" => TupleIndex,
                _ => return None,
            },
            _ => return None,
        };
        Some(method)
    }

    pub fn name(self) -> &'static str {
        use Method::*;
        match self {
            Lower => "lower",
            Upper => "upper",
            Strip => "strip",
            Lstrip => "lstrip",
            Rstrip => "rstrip",
            Split => "split",
            Splitlines => "splitlines",
            Join => "join",
            Replace => "replace",
            Startswith => "startswith",
            Endswith => "endswith",
            Find => "find",
            StrCount | ListCount | TupleCount => "count",
            Format => "format",
            Isdigit => "isdigit",
            Isalpha => "isalpha",
            Isalnum => "isalnum",
            Isspace => "isspace",
            Append => "append",
            Extend => "extend",
            ListPop | DictPop => "pop",
            Insert => "insert",
            ListIndex | TupleIndex => "index",
            Sort => "sort",
            Reverse => "reverse",
            ListCopy | DictCopy | SetCopy => "copy",
            ListClear | DictClear => "clear",
            Popitem => "popitem",
            Remove => "remove",
            Get => "get",
            Keys => "keys",
            Values => "values",
            Items => "items",
            Update => "update",
            Setdefault => "setdefault",
            Add => "add",
            Discard => "discard",
            Union => "union",
            Intersection => "intersection",
            Difference => "difference",
        }
    }
}

pub(crate) fn call(interp: &mut Interp<'_>, receiver: &Value, method: Method, args: Args) -> Result<Value> {
    match receiver {
        Value::Str(text) => str_method(interp, text, method, args),
        Value::List(items) => list_method(interp, items, method, args),
        Value::Dict(table) => dict_method(interp, table, method, args),
        Value::Set(table) => set_method(interp, table, method, args),
        Value::Tuple(items) => sequence_query(items, method, args),
        other => Err(SandboxError::type_error(format!(
            "'{}' object has no method '{}'",
            other.type_name(),
            method.name()
        ))),
    }
}

fn strip_set(args: &mut Args) -> Result<Option<Rc<str>>> {
    args.check(0, 1)?;
    match args.arg(0, "chars") {
        None | Some(Value::None) => Ok(None),
        Some(value) => value.expect_str("chars").map(Some),
    }
}

fn all_chars(text: &str, predicate: impl Fn(char) -> bool) -> Value {
    Value::Bool(!text.is_empty() && text.chars().all(predicate))
}

fn affixes(value: Value, what: &str) -> Result<Vec<Rc<str>>> {
    match value {
        Value::Tuple(items) => items.iter().map(|item| item.expect_str(what)).collect(),
        other => Ok(vec![other.expect_str(what)?]),
    }
}

fn split_whitespace(text: &str, maxsplit: Option<usize>) -> Vec<Value> {
    let mut out = Vec::new();
    let mut rest = text.trim_start();
    while !rest.is_empty() {
        if maxsplit.is_some_and(|max| out.len() == max) {
            out.push(Value::str(rest));
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                out.push(Value::str(&rest[..end]));
                rest = rest[end..].trim_start();
            }
            None => {
                out.push(Value::str(rest));
                break;
            }
        }
    }
    out
}

fn str_method(interp: &mut Interp<'_>, text: &Rc<str>, method: Method, mut args: Args) -> Result<Value> {
    let text: &str = text;
    let value = match method {
        Method::Lower | Method::Upper | Method::Isdigit | Method::Isalpha | Method::Isalnum | Method::Isspace | Method::Splitlines => {
            args.check(0, 0)?;
            args.finish()?;
            match method {
                Method::Lower => Value::str(text.to_lowercase()),
                Method::Upper => Value::str(text.to_uppercase()),
                Method::Isdigit => all_chars(text, |c| c.is_ascii_digit()),
                Method::Isalpha => all_chars(text, char::is_alphabetic),
                Method::Isalnum => all_chars(text, char::is_alphanumeric),
                Method::Isspace => all_chars(text, char::is_whitespace),
                _ => {
                    let lines: Vec<Value> = text.lines().map(Value::str).collect();
                    interp.check_len(lines.len())?;
                    Value::list(lines)
                }
            }
        }
        Method::Strip | Method::Lstrip | Method::Rstrip => {
            let chars = strip_set(&mut args)?;
            args.finish()?;
            let matcher = |c: char| match &chars {
                Some(set) => set.contains(c),
                None => c.is_whitespace(),
            };
            Value::str(match method {
                Method::Strip => text.trim_matches(matcher),
                Method::Lstrip => text.trim_start_matches(matcher),
                _ => text.trim_end_matches(matcher),
            })
        }
        Method::Split => {
            args.check(0, 2)?;
            let sep = args.arg(0, "sep").filter(|v| !matches!(v, Value::None));
            let maxsplit = match args.arg(1, "maxsplit") {
                Some(v) => usize::try_from(v.expect_int("maxsplit")?).ok(),
                None => None,
            };
            args.finish()?;
            let parts = match sep {
                None => split_whitespace(text, maxsplit),
                Some(sep) => {
                    let sep = sep.expect_str("sep")?;
                    if sep.is_empty() {
                        return Err(SandboxError::value_error("empty separator"));
                    }
                    match maxsplit {
                        Some(max) => text.splitn(max + 1, &*sep).map(Value::str).collect(),
                        None => text.split(&*sep).map(Value::str).collect(),
                    }
                }
            };
            interp.check_len(parts.len())?;
            Value::list(parts)
        }
        Method::Join => {
            args.check(1, 1)?;
            let iterable = args.required(0, "iterable")?;
            args.finish()?;
            let mut out = String::new();
            for (i, item) in interp.collect(iterable)?.into_iter().enumerate() {
                let piece = match item {
                    Value::Str(s) => s,
                    other => {
                        return Err(SandboxError::type_error(format!(
                            "sequence item {i}: expected str instance, {} found",
                            other.type_name()
                        )))
                    }
                };
                if i > 0 {
                    out.push_str(text);
                }
                out.push_str(&piece);
                interp.check_str_len(out.len())?;
            }
            Value::str(out)
        }
        Method::Replace => {
            args.check(2, 3)?;
            let old = args.required(0, "old")?.expect_str("old")?;
            let new = args.required(1, "new")?.expect_str("new")?;
            let count = match args.arg(2, "count") {
                Some(v) => usize::try_from(v.expect_int("count")?).ok(),
                None => None,
            };
            args.finish()?;
            if new.len() > old.len() {
                let occurrences = if old.is_empty() {
                    text.chars().count() + 1
                } else {
                    text.matches(&*old).count()
                };
                let occurrences = count.map_or(occurrences, |c| c.min(occurrences));
                let projected = occurrences
                    .saturating_mul(new.len() - old.len())
                    .saturating_add(text.len());
                interp.check_str_len(projected)?;
            }
            Value::str(match count {
                Some(count) => text.replacen(&*old, &new, count),
                None => text.replace(&*old, &new),
            })
        }
        Method::Startswith | Method::Endswith => {
            args.check(1, 1)?;
            let candidates = affixes(args.required(0, "prefix")?, "prefix")?;
            args.finish()?;
            let hit = candidates.iter().any(|affix| {
                if method == Method::Startswith {
                    text.starts_with(&**affix)
                } else {
                    text.ends_with(&**affix)
                }
            });
            Value::Bool(hit)
        }
        Method::Find => {
            args.check(1, 1)?;
            let needle = args.required(0, "sub")?.expect_str("sub")?;
            args.finish()?;
            match text.find(&*needle) {
                Some(byte) => Value::Int(text[..byte].chars().count() as i64),
                None => Value::Int(-1),
            }
        }
        Method::StrCount => {
            args.check(1, 1)?;
            let needle = args.required(0, "sub")?.expect_str("sub")?;
            args.finish()?;
            let n = if needle.is_empty() {
                text.chars().count() + 1
            } else {
                text.matches(&*needle).count()
            };
            Value::Int(n as i64)
        }
        Method::Format => Value::str(format_method(interp, text, args)?),
        _ => return Err(SandboxError::type_error(format!("str has no method '{}'", method.name()))),
    };
    if let Value::Str(s) = &value {
        interp.check_str_len(s.len())?;
    }
    Ok(value)
}

fn not_found(what: &str) -> SandboxError {
    SandboxError::value_error(format!("{what} is not in list"))
}

/// Read-only queries shared by lists and tuples.
fn sequence_query(items: &[Value], method: Method, mut args: Args) -> Result<Value> {
    args.check(1, 1)?;
    let needle = args.required(0, "value")?;
    args.finish()?;
    match method {
        Method::ListCount | Method::TupleCount => {
            Ok(Value::Int(items.iter().filter(|v| ops::equal(v, &needle)).count() as i64))
        }
        Method::ListIndex | Method::TupleIndex => items
            .iter()
            .position(|v| ops::equal(v, &needle))
            .map(|i| Value::Int(i as i64))
            .ok_or_else(|| not_found("value")),
        _ => Err(SandboxError::type_error(format!(
            "sequence has no method '{}'",
            method.name()
        ))),
    }
}

fn list_method(
    interp: &mut Interp<'_>,
    items: &Rc<std::cell::RefCell<Vec<Value>>>,
    method: Method,
    mut args: Args,
) -> Result<Value> {
    match method {
        Method::Append => {
            args.check(1, 1)?;
            let value = args.required(0, "object")?;
            args.finish()?;
            let len = items.borrow().len();
            interp.check_len(len + 1)?;
            items.borrow_mut().push(value);
            Ok(Value::None)
        }
        Method::Extend => {
            args.check(1, 1)?;
            let iterable = args.required(0, "iterable")?;
            args.finish()?;
            let extra = interp.collect(iterable)?;
            let len = items.borrow().len();
            interp.check_len(len + extra.len())?;
            items.borrow_mut().extend(extra);
            Ok(Value::None)
        }
        Method::ListPop => {
            args.check(0, 1)?;
            let index = match args.arg(0, "index") {
                Some(v) => v.expect_int("index")?,
                None => -1,
            };
            args.finish()?;
            let mut items = items.borrow_mut();
            if items.is_empty() {
                return Err(SandboxError::runtime(RuntimeKind::IndexError, "pop from empty list"));
            }
            let len = items.len() as i64;
            let adjusted = if index < 0 { index + len } else { index };
            if adjusted < 0 || adjusted >= len {
                return Err(SandboxError::runtime(RuntimeKind::IndexError, "pop index out of range"));
            }
            Ok(items.remove(adjusted as usize))
        }
        Method::Insert => {
            args.check(2, 2)?;
            let index = args.required(0, "index")?.expect_int("index")?;
            let value = args.required(1, "object")?;
            args.finish()?;
            let len = items.borrow().len();
            interp.check_len(len + 1)?;
            let len = len as i64;
            let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.borrow_mut().insert(at as usize, value);
            Ok(Value::None)
        }
        Method::ListIndex | Method::ListCount => {
            let snapshot = items.borrow().clone();
            sequence_query(&snapshot, method, args)
        }
        Method::Sort => {
            args.check(0, 0)?;
            let key = args.keyword("key").filter(|k| !matches!(k, Value::None));
            let reverse = args.keyword("reverse").is_some_and(|r| r.truthy());
            args.finish()?;
            let snapshot = items.borrow().clone();
            let sorted = sort_values(interp, snapshot, key.as_ref(), reverse)?;
            *items.borrow_mut() = sorted;
            Ok(Value::None)
        }
        Method::Reverse | Method::ListClear => {
            args.check(0, 0)?;
            args.finish()?;
            let mut items = items.borrow_mut();
            if method == Method::Reverse {
                items.reverse();
            } else {
                items.clear();
            }
            Ok(Value::None)
        }
        Method::ListCopy => {
            args.check(0, 0)?;
            args.finish()?;
            Ok(Value::list(items.borrow().clone()))
        }
        Method::Remove => {
            args.check(1, 1)?;
            let needle = args.required(0, "value")?;
            args.finish()?;
            let position = items.borrow().iter().position(|v| ops::equal(v, &needle));
            match position {
                Some(i) => {
                    items.borrow_mut().remove(i);
                    Ok(Value::None)
                }
                None => Err(not_found("list.remove(x): x")),
            }
        }
        other => Err(SandboxError::type_error(format!("list has no method '{}'", other.name()))),
    }
}

fn key_error(key: &Value) -> SandboxError {
    SandboxError::runtime(RuntimeKind::KeyError, super::render::repr(key))
}

fn dict_method(
    interp: &mut Interp<'_>,
    table: &Rc<std::cell::RefCell<Table>>,
    method: Method,
    mut args: Args,
) -> Result<Value> {
    match method {
        Method::Get => {
            args.check(1, 2)?;
            let key = args.required(0, "key")?;
            let default = args.arg(1, "default").unwrap_or(Value::None);
            args.finish()?;
            let found = table.borrow().get(&key)?;
            Ok(found.unwrap_or(default))
        }
        Method::Keys | Method::Values | Method::Items | Method::DictCopy => {
            args.check(0, 0)?;
            args.finish()?;
            let table = table.borrow();
            Ok(match method {
                Method::Keys => Value::list(table.keys()),
                Method::Values => Value::list(table.values()),
                Method::Items => Value::list(
                    table
                        .items()
                        .into_iter()
                        .map(|(k, v)| Value::tuple(vec![k, v]))
                        .collect(),
                ),
                _ => Value::dict(table.clone()),
            })
        }
        Method::DictPop => {
            args.check(1, 2)?;
            let key = args.required(0, "key")?;
            let default = args.arg(1, "default");
            args.finish()?;
            let removed = table.borrow_mut().remove(&key)?;
            match (removed, default) {
                (Some(value), _) => Ok(value),
                (None, Some(default)) => Ok(default),
                (None, None) => Err(key_error(&key)),
            }
        }
        Method::DictClear => {
            args.check(0, 0)?;
            args.finish()?;
            table.borrow_mut().clear();
            Ok(Value::None)
        }
        Method::Popitem => {
            args.check(0, 0)?;
            args.finish()?;
            let (key, value) = table.borrow_mut().pop_last().ok_or_else(|| {
                SandboxError::runtime(RuntimeKind::KeyError, "'popitem(): dictionary is empty'")
            })?;
            Ok(Value::tuple(vec![key, value]))
        }
        Method::Update => {
            args.check(0, 1)?;
            let Args {
                positional,
                keywords,
                ..
            } = args;
            let mut pairs = Vec::new();
            if let Some(source) = positional.into_iter().next() {
                match &source {
                    Value::Dict(other) => pairs.extend(other.borrow().items()),
                    _ => {
                        for pair in interp.collect(source)? {
                            let pair = interp.collect(pair)?;
                            let [key, value]: [Value; 2] = pair.try_into().map_err(|_| {
                                SandboxError::value_error("dictionary update sequence element has wrong length")
                            })?;
                            pairs.push((key, value));
                        }
                    }
                }
            }
            pairs.extend(keywords.into_iter().map(|(k, v)| (Value::str(k), v)));
            let mut table = table.borrow_mut();
            for (key, value) in pairs {
                table.insert(key, value)?;
            }
            interp.check_len(table.len())?;
            Ok(Value::None)
        }
        Method::Setdefault => {
            args.check(1, 2)?;
            let key = args.required(0, "key")?;
            let default = args.arg(1, "default").unwrap_or(Value::None);
            args.finish()?;
            let existing = table.borrow().get(&key)?;
            match existing {
                Some(value) => Ok(value),
                None => {
                    let len = table.borrow().len();
                    interp.check_len(len + 1)?;
                    table.borrow_mut().insert(key, default.clone())?;
                    Ok(default)
                }
            }
        }
        other => Err(SandboxError::type_error(format!("dict has no method '{}'", other.name()))),
    }
}

fn set_method(
    interp: &mut Interp<'_>,
    table: &Rc<std::cell::RefCell<Table>>,
    method: Method,
    mut args: Args,
) -> Result<Value> {
    match method {
        Method::Add | Method::Discard => {
            args.check(1, 1)?;
            let item = args.required(0, "element")?;
            args.finish()?;
            if method == Method::Add {
                let len = table.borrow().len();
                interp.check_len(len + 1)?;
                table.borrow_mut().insert(item, Value::None)?;
            } else {
                table.borrow_mut().remove(&item)?;
            }
            Ok(Value::None)
        }
        Method::SetCopy => {
            args.check(0, 0)?;
            args.finish()?;
            Ok(Value::set(table.borrow().clone()))
        }
        Method::Union | Method::Intersection | Method::Difference => {
            let others = args.into_positional()?;
            let mut result = table.borrow().clone();
            for other in others {
                let other = Table::from_keys(interp.collect(other)?)?;
                result = match method {
                    Method::Union => ops::union(&result, &other)?,
                    Method::Intersection => ops::intersection(&result, &other)?,
                    _ => ops::difference(&result, &other)?,
                };
                interp.check_len(result.len())?;
            }
            Ok(Value::set(result))
        }
        other => Err(SandboxError::type_error(format!("set has no method '{}'", other.name()))),
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
    fn resolution_is_by_receiver_type() {
        assert_eq!(Method::resolve(&Value::str("x"), "upper"), Some(Method::Upper));
        assert_eq!(Method::resolve(&Value::list(vec![]), "upper"), None);
        assert_eq!(Method::resolve(&Value::Int(1), "real"), None);
        assert!(matches!(
            run("(1).bit_length()").unwrap_err(),
            SandboxError::Runtime { error: RuntimeKind::AttributeError, .. }
        ));
    }

    #[test]
    fn string_methods() {
        assert_eq!(repr("'  a b  '.strip().upper()"), "'A B'");
        assert_eq!(repr("'a,b,,c'.split(',')"), "['a', 'b', '', 'c']");
        assert_eq!(repr("' a  b c '.split(None, 1)"), "['a', 'b c ']");
        assert_eq!(repr("'-'.join(['x', 'y'])"), "'x-y'");
        assert_eq!(repr("'aaa'.replace('a', 'b', 2)"), "'bba'");
        assert_eq!(repr("'main.rs'.endswith(('.rs', '.py'))"), "True");
        assert_eq!(repr("'héllo'.find('l'), 'x'.find('y')"), "(2, -1)");
        assert_eq!(repr("'xxlxx'.strip('x'), 'banana'.count('an')"), "('l', 2)");
        assert_eq!(repr("'a\\nb\\r\\nc'.splitlines()"), "['a', 'b', 'c']");
        assert_eq!(repr("'123'.isdigit(), ''.isdigit()"), "(True, False)");
    }

    #[test]
    fn list_methods_mutate_in_place() {
        let source = "xs = [3, 1, 2]\nxs.append(4)\nxs.sort(reverse=True)\nxs.insert(0, 9)\nxs.remove(1)\nlast = xs.pop()\n(xs, last, xs.index(3))";
        assert_eq!(repr(source), "([9, 4, 3], 2, 2)");
        assert!(run("[].pop()").is_err());
        assert!(run("[1].remove(2)").is_err());
    }

    #[test]
    fn dict_and_set_methods() {
        let source = "d = {'a': 1}\nd.update({'b': 2}, c=3)\nd.setdefault('a', 0)\n(d.get('z', 0), d.pop('b'), sorted(d.keys()), d.items()[0])";
        assert_eq!(repr(source), "(0, 2, ['a', 'c'], ('a', 1))");
        let source = "d = {'a': 1, 'b': 2}\nlast = d.popitem()\nleft = len(d)\nd.clear()\n(last, left, d)";
        assert_eq!(repr(source), "(('b', 2), 1, {})");
        assert!(matches!(
            run("{}.popitem()").unwrap_err(),
            SandboxError::Runtime { error: RuntimeKind::KeyError, .. }
        ));
        let source = "s = {1}\ns.add(2)\ns.discard(5)\n(sorted(s.union([3])), sorted(s.intersection({2, 3})), sorted(s.difference([1])))";
        assert_eq!(repr(source), "([1, 2, 3], [2], [2])");
    }
}
