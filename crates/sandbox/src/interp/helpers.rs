//! Host-provided scouting helpers over the session context.
//!
//! Helpers are plain enum variants dispatched by [`call`]; they read the
//! immutable [`ScoutData`] and never hand out references to interpreter state.
//! Offsets are byte offsets into `context`, snapped to character boundaries.
//! Line numbers are 1-based.

use super::{Args, Interp, ScoutData};
use crate::error::{Result, RuntimeKind, SandboxError};
use crate::search::compile;
use crate::value::{Table, Value};
use chunkwise_chunker::{BoundaryProducer, ChunkerConfig, FixedSizeProducer};

const DEFAULT_PEEK_BYTES: i64 = 2_000;
const DEFAULT_HEAD_LINES: i64 = 10;
const DEFAULT_GREP_MATCHES: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Helper {
    Peek,
    Lines,
    Head,
    Tail,
    Grep,
    Count,
    ChunkSpans,
    FileText,
}

impl Helper {
    const ALL: &'static [Helper] = &[
        Self::Peek,
        Self::Lines,
        Self::Head,
        Self::Tail,
        Self::Grep,
        Self::Count,
        Self::ChunkSpans,
        Self::FileText,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|h| h.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Peek => "peek",
            Self::Lines => "lines",
            Self::Head => "head",
            Self::Tail => "tail",
            Self::Grep => "grep",
            Self::Count => "count",
            Self::ChunkSpans => "chunk_spans",
            Self::FileText => "file_text",
        }
    }
}

fn record(fields: Vec<(&str, Value)>) -> Result<Value> {
    let mut table = Table::default();
    for (key, value) in fields {
        table.insert(Value::str(key), value)?;
    }
    Ok(Value::dict(table))
}

fn int(n: usize) -> Value {
    Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
}

/// `files`: one record per `### File:` section.
pub(crate) fn files_value(data: &ScoutData) -> Value {
    let files = data
        .sections
        .iter()
        .filter_map(|section| {
            let lines = section.body(&data.context).lines().count();
            record(vec![
                ("path", Value::str(section.path.as_str())),
                ("start", int(section.body_start)),
                ("end", int(section.end)),
                ("lines", int(lines)),
            ])
            .ok()
        })
        .collect();
    Value::list(files)
}

fn floor_boundary(text: &str, offset: usize) -> usize {
    let mut offset = offset.min(text.len());
    while offset > 0 && !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

fn optional_int(args: &mut Args, index: usize, name: &str) -> Result<Option<i64>> {
    match args.arg(index, name) {
        None | Some(Value::None) => Ok(None),
        Some(value) => value.expect_int(name).map(Some),
    }
}

fn non_negative(value: i64, name: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| SandboxError::value_error(format!("{name} must be >= 0")))
}

pub(crate) fn call(interp: &mut Interp<'_>, helper: Helper, mut args: Args) -> Result<Value> {
    let data = interp.data;
    let context: &str = &data.context;
    match helper {
        Helper::Peek => {
            args.check(0, 2)?;
            let start = optional_int(&mut args, 0, "start")?.unwrap_or(0);
            let end = optional_int(&mut args, 1, "end")?.unwrap_or(start.saturating_add(DEFAULT_PEEK_BYTES));
            args.finish()?;
            let start = floor_boundary(context, non_negative(start, "start")?);
            let end = floor_boundary(context, non_negative(end, "end")?).max(start);
            interp.check_str_len(end - start)?;
            Ok(Value::str(&context[start..end]))
        }
        Helper::Lines => {
            args.check(0, 2)?;
            let start = optional_int(&mut args, 0, "start")?.unwrap_or(1).max(1);
            let end = optional_int(&mut args, 1, "end")?;
            args.finish()?;
            let skip = non_negative(start - 1, "start")?;
            let take = match end {
                Some(end) if end < start => 0,
                Some(end) => non_negative(end - start + 1, "end")?,
                None => usize::MAX,
            };
            let mut out = String::new();
            for line in context.split_inclusive('\n').skip(skip).take(take) {
                interp.tick()?;
                out.push_str(line);
                interp.check_str_len(out.len())?;
            }
            Ok(Value::str(out))
        }
        Helper::Head | Helper::Tail => {
            args.check(0, 1)?;
            let n = non_negative(optional_int(&mut args, 0, "n")?.unwrap_or(DEFAULT_HEAD_LINES), "n")?;
            args.finish()?;
            interp.check_len(n.min(context.len()))?;
            let picked: Vec<Value> = if helper == Helper::Head {
                context.lines().take(n).map(Value::str).collect()
            } else {
                let total = context.lines().count();
                context.lines().skip(total.saturating_sub(n)).map(Value::str).collect()
            };
            Ok(Value::list(picked))
        }
        Helper::Grep => {
            args.check(1, 2)?;
            let pattern = args.required(0, "pattern")?.expect_str("pattern")?;
            let limit = non_negative(
                optional_int(&mut args, 1, "max_matches")?.unwrap_or(DEFAULT_GREP_MATCHES),
                "max_matches",
            )?;
            let ignore_case = args.keyword("ignore_case").is_some_and(|v| v.truthy());
            args.finish()?;
            let regex = compile(&pattern, ignore_case)?;

            let mut out = Vec::new();
            let mut offset = 0usize;
            for (index, line) in context.split_inclusive('\n').enumerate() {
                interp.tick()?;
                let text = line.trim_end_matches(['\n', '\r']);
                if regex.is_match(text) {
                    if out.len() == limit {
                        break;
                    }
                    let section = data
                        .sections
                        .iter()
                        .find(|s| s.body_start <= offset && offset < s.end);
                    let (file, file_line) = match section {
                        Some(s) => (Value::str(s.path.as_str()), int(s.file_line_at(context, offset))),
                        None => (Value::None, Value::None),
                    };
                    out.push(record(vec![
                        ("line", int(index + 1)),
                        ("text", Value::str(text)),
                        ("file", file),
                        ("file_line", file_line),
                    ])?);
                    interp.check_len(out.len())?;
                }
                offset += line.len();
            }
            Ok(Value::list(out))
        }
        Helper::Count => {
            args.check(1, 1)?;
            let pattern = args.required(0, "pattern")?.expect_str("pattern")?;
            let ignore_case = args.keyword("ignore_case").is_some_and(|v| v.truthy());
            args.finish()?;
            let regex = compile(&pattern, ignore_case)?;
            let mut total = 0usize;
            for _ in regex.find_iter(context) {
                interp.tick()?;
                total += 1;
            }
            Ok(int(total))
        }
        Helper::ChunkSpans => {
            args.check(0, 2)?;
            let size = optional_int(&mut args, 0, "size")?;
            let overlap = optional_int(&mut args, 1, "overlap")?;
            args.finish()?;
            let config = ChunkerConfig {
                size: match size {
                    Some(size) => non_negative(size, "size")?,
                    None => data.chunk_size,
                },
                overlap: match overlap {
                    Some(overlap) => non_negative(overlap, "overlap")?,
                    None => data.chunk_overlap,
                },
                ..ChunkerConfig::default()
            };
            let producer = FixedSizeProducer::new(config).map_err(|e| SandboxError::value_error(e.to_string()))?;
            let spans = producer
                .spans(context, Some(interp.deadline()))
                .map_err(|e| SandboxError::value_error(e.to_string()))?;
            interp.check_len(spans.len())?;
            Ok(Value::list(
                spans
                    .into_iter()
                    .map(|span| Value::tuple(vec![int(span.start), int(span.end)]))
                    .collect(),
            ))
        }
        Helper::FileText => {
            args.check(1, 1)?;
            let path = args.required(0, "path")?.expect_str("path")?;
            args.finish()?;
            let section = data
                .sections
                .iter()
                .find(|s| s.path == *path)
                .ok_or_else(|| SandboxError::runtime(RuntimeKind::KeyError, format!("'{path}'")))?;
            Ok(Value::str(section.body(context)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::run_with;
    use crate::config::EvalLimits;
    use chunkwise_chunker::render_section_header;
    use pretty_assertions::assert_eq;

    fn corpus() -> String {
        format!(
            "{}fn alpha() {{}}\nfn beta() {{}}\n{}def gamma():\n    return 'alpha'\n",
            render_section_header("src/lib.rs"),
            render_section_header("tools/gen.py")
        )
    }

    fn repr(source: &str) -> String {
        run_with(source, &corpus(), EvalLimits::default()).unwrap().repr
    }

    #[test]
    fn files_lists_sections() {
        assert_eq!(repr("[f['path'] for f in files]"), "['src/lib.rs', 'tools/gen.py']");
        assert_eq!(repr("[f['lines'] for f in files]"), "[2, 2]");
    }

    #[test]
    fn grep_maps_context_lines_to_files() {
        let out = repr("[(m['file'], m['file_line'], m['line']) for m in grep('alpha')]");
        assert_eq!(out, "[('src/lib.rs', 1, 2), ('tools/gen.py', 2, 6)]");
        assert_eq!(repr("len(grep('ALPHA', ignore_case=True))"), "2");
        assert_eq!(repr("len(grep('fn', 1))"), "1");
    }

    #[test]
    fn line_helpers() {
        assert_eq!(repr("head(1)"), "['### File: src/lib.rs']");
        assert_eq!(repr("tail(1)"), "[\"    return 'alpha'\"]");
        assert_eq!(repr("lines(2, 3)"), "'fn alpha() {}\\nfn beta() {}\\n'");
        assert_eq!(repr("count('fn ')"), "2");
        assert_eq!(repr("peek(0, 3)"), "'###'");
    }

    #[test]
    fn file_text_and_chunk_spans() {
        assert_eq!(repr("file_text('src/lib.rs')"), "'fn alpha() {}\\nfn beta() {}\\n'");
        assert!(run_with("file_text('missing.rs')", &corpus(), EvalLimits::default()).is_err());
        assert_eq!(repr("chunk_spans(40, 0)[0]"), "(0, 35)");
        assert_eq!(repr("chunk_spans()[-1][1] == len(context)"), "True");
    }

    #[test]
    fn pathological_grep_patterns_are_rejected() {
        let err = run_with("grep('(a+)+$')", &corpus(), EvalLimits::default()).unwrap_err();
        assert!(matches!(err, crate::error::SandboxError::RejectedPattern { .. }));
    }
}
