//! Pattern search over a bounded slice of text.
//!
//! Two independent defenses: [`check_pattern`] rejects known pathological
//! shapes before compilation, and the search itself runs inside the same
//! isolated, time-bounded worker as evaluations (see [`crate::Sandbox::search`]).

use crate::error::{Result, SandboxError};
use regex::{Regex, RegexBuilder};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Instant;

const MAX_PATTERN_LEN: usize = 1_000;
const MAX_UNBOUNDED_WILDCARDS: usize = 3;
const REGEX_SIZE_LIMIT: usize = 1 << 20;
const MAX_MATCH_TEXT: usize = 500;
const DEADLINE_POLL_LINES: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SearchOptions {
    pub case_insensitive: bool,
    /// Stop after this many matches and report `truncated`
    pub max_matches: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            case_insensitive: false,
            max_matches: 1_000,
        }
    }
}

/// Byte range of the searched slice; ends are clamped to the text and
/// snapped to character boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SearchRange {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SearchMatch {
    /// 1-based line number in the full text
    pub line: usize,
    /// Byte offsets of the match in the full text
    pub start: usize,
    pub end: usize,
    /// The matching line, trimmed to a bounded length
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SearchOutcome {
    pub matches: Vec<SearchMatch>,
    pub truncated: bool,
    pub scanned_bytes: usize,
}

fn rejected(reason: impl Into<String>) -> SandboxError {
    SandboxError::RejectedPattern {
        reason: reason.into(),
    }
}

struct Group {
    unbounded_inside: bool,
    branches: Vec<String>,
    current: String,
}

impl Group {
    fn new() -> Self {
        Self {
            unbounded_inside: false,
            branches: Vec::new(),
            current: String::new(),
        }
    }

    fn close(mut self) -> Result<bool> {
        self.branches.push(std::mem::take(&mut self.current));
        if self.branches.len() > 1 {
            let mut seen = std::collections::HashSet::new();
            for branch in &self.branches {
                if !seen.insert(branch.as_str()) {
                    return Err(rejected(format!("alternation repeats the branch `{branch}`")));
                }
            }
        }
        Ok(self.unbounded_inside)
    }
}

/// Length in chars of an unbounded quantifier starting at `chars[i]`
/// (`*`, `+`, `{n,}`), if there is one.
fn unbounded_quantifier(chars: &[char], i: usize) -> Option<usize> {
    match chars.get(i)? {
        '*' | '+' => Some(1),
        '{' => {
            let close = chars[i..].iter().position(|c| *c == '}')? + i;
            let body: String = chars[i + 1..close].iter().collect();
            let (min, max) = body.split_once(',')?;
            (!min.is_empty() && min.chars().all(|c| c.is_ascii_digit()) && max.trim().is_empty())
                .then_some(close - i + 1)
        }
        _ => None,
    }
}

/// Reject pattern shapes with super-linear matching cost on backtracking
/// engines: nested unbounded quantifiers, alternations with identical
/// branches and stacked unbounded wildcards.
pub fn check_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(rejected("empty pattern"));
    }
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(rejected(format!(
            "pattern is {} bytes; the limit is {MAX_PATTERN_LEN}",
            pattern.len()
        )));
    }

    let chars: Vec<char> = pattern.chars().collect();
    let mut stack = vec![Group::new()];
    let mut wildcards = 0usize;
    let mut previous_wildcard_end: Option<usize> = None;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => {
                let token: String = chars[i..(i + 2).min(chars.len())].iter().collect();
                if let Some(group) = stack.last_mut() {
                    group.current.push_str(&token);
                }
                i += 2;
                if let Some(len) = unbounded_quantifier(&chars, i) {
                    if let Some(group) = stack.last_mut() {
                        group.unbounded_inside = true;
                    }
                    i += len;
                }
                continue;
            }
            '[' => {
                let mut j = i + 1;
                if chars.get(j) == Some(&'^') {
                    j += 1;
                }
                if chars.get(j) == Some(&']') {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    if chars[j] == '\\' {
                        j += 1;
                    }
                    j += 1;
                }
                let class: String = chars[i..(j + 1).min(chars.len())].iter().collect();
                if let Some(group) = stack.last_mut() {
                    group.current.push_str(&class);
                }
                i = j + 1;
                if let Some(len) = unbounded_quantifier(&chars, i) {
                    if let Some(group) = stack.last_mut() {
                        group.unbounded_inside = true;
                    }
                    i += len;
                }
                continue;
            }
            '(' => {
                stack.push(Group::new());
                i += 1;
                continue;
            }
            ')' => {
                if stack.len() == 1 {
                    return Err(SandboxError::InvalidPattern {
                        message: "unbalanced parenthesis".to_string(),
                    });
                }
                let inner = stack.pop().map(Group::close).transpose()?.unwrap_or(false);
                i += 1;
                let quantified = unbounded_quantifier(&chars, i);
                if inner && quantified.is_some() {
                    return Err(rejected("nested unbounded quantifiers"));
                }
                if let Some(parent) = stack.last_mut() {
                    parent.unbounded_inside |= inner || quantified.is_some();
                    parent.current.push_str("(...)");
                }
                i += quantified.unwrap_or(0);
                continue;
            }
            '|' => {
                if let Some(group) = stack.last_mut() {
                    let branch = std::mem::take(&mut group.current);
                    group.branches.push(branch);
                }
                i += 1;
                continue;
            }
            '.' => {
                if let Some(len) = unbounded_quantifier(&chars, i + 1) {
                    wildcards += 1;
                    if previous_wildcard_end == Some(i) {
                        return Err(rejected("adjacent unbounded wildcards"));
                    }
                    if wildcards > MAX_UNBOUNDED_WILDCARDS {
                        return Err(rejected(format!(
                            "more than {MAX_UNBOUNDED_WILDCARDS} unbounded wildcards"
                        )));
                    }
                    let mut end = i + 1 + len;
                    if chars.get(end) == Some(&'?') {
                        end += 1;
                    }
                    previous_wildcard_end = Some(end);
                    if let Some(group) = stack.last_mut() {
                        group.unbounded_inside = true;
                        group.current.push_str(".*");
                    }
                    i = end;
                    continue;
                }
            }
            _ => {}
        }
        if let Some(len) = unbounded_quantifier(&chars, i) {
            if let Some(group) = stack.last_mut() {
                group.unbounded_inside = true;
            }
            i += len;
            continue;
        }
        if let Some(group) = stack.last_mut() {
            group.current.push(c);
        }
        i += 1;
    }

    if stack.len() != 1 {
        return Err(SandboxError::InvalidPattern {
            message: "unclosed group".to_string(),
        });
    }
    stack.pop().map(Group::close).transpose()?;
    Ok(())
}

/// Vet and compile a pattern with bounded compiled size.
pub(crate) fn compile(pattern: &str, case_insensitive: bool) -> Result<Regex> {
    check_pattern(pattern)?;
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .size_limit(REGEX_SIZE_LIMIT)
        .dfa_size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|err| SandboxError::InvalidPattern {
            message: err.to_string(),
        })
}

fn floor_boundary(text: &str, offset: usize) -> usize {
    let mut offset = offset.min(text.len());
    while offset > 0 && !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

fn clip(line: &str) -> String {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.len() <= MAX_MATCH_TEXT {
        return line.to_string();
    }
    let cut = floor_boundary(line, MAX_MATCH_TEXT);
    format!("{}...", &line[..cut])
}

/// Run a vetted pattern over `text[range]`, line by line, until the deadline.
pub fn run_search(
    pattern: &str,
    text: &str,
    range: Option<SearchRange>,
    options: &SearchOptions,
    deadline: Instant,
    limit_ms: u64,
) -> Result<SearchOutcome> {
    let regex = compile(pattern, options.case_insensitive)?;
    let (start, end) = match range {
        Some(range) => {
            let start = floor_boundary(text, range.start);
            (start, floor_boundary(text, range.end).max(start))
        }
        None => (0, text.len()),
    };

    let mut line_number = text[..start].matches('\n').count() + 1;
    let mut offset = start;
    let mut matches = Vec::new();
    let mut truncated = false;

    'lines: for (index, line) in text[start..end].split_inclusive('\n').enumerate() {
        if index % DEADLINE_POLL_LINES == 0 && Instant::now() >= deadline {
            return Err(SandboxError::Timeout { limit_ms });
        }
        for found in regex.find_iter(line) {
            if matches.len() == options.max_matches {
                truncated = true;
                break 'lines;
            }
            matches.push(SearchMatch {
                line: line_number,
                start: offset + found.start(),
                end: offset + found.end(),
                text: clip(line),
            });
        }
        offset += line.len();
        line_number += 1;
    }

    Ok(SearchOutcome {
        matches,
        truncated,
        scanned_bytes: end - start,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn pathological_shapes_are_rejected() {
        for pattern in [
            "(a+)+$",
            "(a*)*b",
            "(x+x+)+y",
            "(\\w+\\s?){2,}$",
            "(a|a)*",
            "(ab|cd|ab)",
            ".*.*=.*",
            ".+.*x",
            "a.*b.*c.*d.*e",
        ] {
            assert!(
                matches!(check_pattern(pattern), Err(SandboxError::RejectedPattern { .. })),
                "{pattern}"
            );
        }
    }

    #[test]
    fn ordinary_patterns_pass() {
        for pattern in [
            r"fn\s+\w+",
            r"TODO|FIXME",
            r"^use [a-z_:]+;$",
            r"(foo|bar)baz",
            r"(\d+)-(\d+)",
            r"a.*b",
            r"[(+*]",
            r"x{2,5}",
        ] {
            assert!(check_pattern(pattern).is_ok(), "{pattern}");
        }
    }

    #[test]
    fn unbalanced_patterns_are_invalid() {
        assert!(matches!(check_pattern("a)"), Err(SandboxError::InvalidPattern { .. })));
        assert!(matches!(check_pattern("(a"), Err(SandboxError::InvalidPattern { .. })));
        assert!(matches!(compile("[a-", false), Err(SandboxError::InvalidPattern { .. })));
    }

    #[test]
    fn search_reports_lines_and_offsets() {
        let text = "alpha\nbeta gamma\ngamma\n";
        let outcome = run_search("gamma", text, None, &SearchOptions::default(), soon(), 5_000).unwrap();
        assert_eq!(outcome.matches.len(), 2);
        assert_eq!(outcome.matches[0].line, 2);
        assert_eq!(&text[outcome.matches[0].start..outcome.matches[0].end], "gamma");
        assert_eq!(outcome.matches[0].text, "beta gamma");
        assert_eq!(outcome.matches[1].line, 3);
        assert!(!outcome.truncated);
        assert_eq!(outcome.scanned_bytes, text.len());
    }

    #[test]
    fn search_respects_range_and_cap() {
        let text = "x\nx\nx\nx\n";
        let range = SearchRange { start: 2, end: 8 };
        let options = SearchOptions {
            max_matches: 2,
            ..SearchOptions::default()
        };
        let outcome = run_search("x", text, Some(range), &options, soon(), 5_000).unwrap();
        assert_eq!(outcome.matches.iter().map(|m| m.line).collect::<Vec<_>>(), vec![2, 3]);
        assert!(outcome.truncated);
    }

    #[test]
    fn expired_deadline_times_out() {
        let err = run_search("x", "x\n", None, &SearchOptions::default(), Instant::now(), 7).unwrap_err();
        assert_eq!(err, SandboxError::Timeout { limit_ms: 7 });
    }
}
