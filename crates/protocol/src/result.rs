use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Outcome status reported by an analysis worker for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Partial,
    Failed,
}

impl ResultStatus {
    /// Completed and partial results both carry usable findings.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Completed | Self::Partial)
    }
}

/// Confidence tier attached to a finding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Default for Confidence {
    fn default() -> Self {
        Self::Medium
    }
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Where a finding points: a file (optionally a line range) or free-form context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum SourceLocation {
    File {
        file: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_line: Option<u32>,
    },
    Context {
        context: String,
    },
}

impl SourceLocation {
    pub fn file(path: impl Into<String>, line: Option<u32>) -> Self {
        Self::File {
            file: path.into(),
            line,
            end_line: None,
        }
    }

    pub fn context(text: impl Into<String>) -> Self {
        Self::Context {
            context: text.into(),
        }
    }

    /// Parse a `path:line` / `path:start-end` / bare path / free-form string.
    ///
    /// Anything without a path-like shape (no extension, contains whitespace)
    /// is kept as free-form context.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let (path, lines) = match raw.rsplit_once(':') {
            Some((path, tail)) if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit() || c == '-') => {
                (path, Some(tail))
            }
            _ => (raw, None),
        };

        let looks_like_path = !path.is_empty()
            && !path.chars().any(char::is_whitespace)
            && (path.contains('.') || path.contains('/'));
        if !looks_like_path {
            return Self::context(raw);
        }

        let (line, end_line) = match lines {
            Some(spec) => match spec.split_once('-') {
                Some((start, end)) => (start.parse().ok(), end.parse().ok()),
                None => (spec.parse().ok(), None),
            },
            None => (None, None),
        };

        Self::File {
            file: path.to_string(),
            line,
            end_line,
        }
    }

    pub fn file_path(&self) -> Option<&str> {
        match self {
            Self::File { file, .. } => Some(file.as_str()),
            Self::Context { .. } => None,
        }
    }

    /// Inclusive line range, if the location names one.
    pub fn line_range(&self) -> Option<(u32, u32)> {
        match self {
            Self::File {
                line: Some(start),
                end_line,
                ..
            } => Some((*start, end_line.unwrap_or(*start).max(*start))),
            _ => None,
        }
    }

    /// Two locations overlap when they name the same file and their line
    /// ranges intersect (a missing range covers the whole file), or when both
    /// are identical free-form contexts.
    pub fn overlaps(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::File { file: a, .. }, Self::File { file: b, .. }) => {
                if path_key(a) != path_key(b) {
                    return false;
                }
                match (self.line_range(), other.line_range()) {
                    (Some((s1, e1)), Some((s2, e2))) => s1 <= e2 && s2 <= e1,
                    _ => true,
                }
            }
            (Self::Context { context: a }, Self::Context { context: b }) => {
                a.trim().eq_ignore_ascii_case(b.trim())
            }
            _ => false,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::File {
                file,
                line: Some(line),
                end_line: Some(end),
            } if end != line => format!("{file}:{line}-{end}"),
            Self::File {
                file,
                line: Some(line),
                ..
            } => format!("{file}:{line}"),
            Self::File { file, .. } => file.clone(),
            Self::Context { context } => context.clone(),
        }
    }
}

fn path_key(path: &str) -> String {
    crate::path_filters::normalize_path(path)
}

/// One claim made by an analysis worker about the analysed code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Finding {
    pub point: String,
    #[serde(default)]
    pub evidence: String,
    #[serde(default)]
    pub confidence: Confidence,
    pub source: SourceLocation,
}

/// Everything an analysis worker reports for a single chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChunkResult {
    pub chunk_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub missing_info: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_answer: Option<String>,
}

impl ChunkResult {
    pub fn failed(chunk_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            status: ResultStatus::Failed,
            findings: Vec::new(),
            missing_info: vec![reason.into()],
            partial_answer: None,
        }
    }

    /// Check a worker-supplied result before it is recorded.
    pub fn validate(&self, expected_chunk_id: &str) -> Result<(), String> {
        if self.chunk_id != expected_chunk_id {
            return Err(format!(
                "result chunk_id {:?} does not match dispatched chunk {:?}",
                self.chunk_id, expected_chunk_id
            ));
        }
        if let Some(idx) = self.findings.iter().position(|f| f.point.trim().is_empty()) {
            return Err(format!("finding #{idx} has an empty point"));
        }
        if self.status == ResultStatus::Failed && !self.findings.is_empty() {
            return Err("failed result must not carry findings".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_path_with_line_and_range() {
        assert_eq!(
            SourceLocation::parse("src/a.py:12"),
            SourceLocation::file("src/a.py", Some(12))
        );
        assert_eq!(
            SourceLocation::parse("src/a.py:3-9").line_range(),
            Some((3, 9))
        );
        assert_eq!(
            SourceLocation::parse("src/lib.rs").file_path(),
            Some("src/lib.rs")
        );
    }

    #[test]
    fn free_form_text_stays_context() {
        assert_eq!(
            SourceLocation::parse("the login flow"),
            SourceLocation::context("the login flow")
        );
    }

    #[test]
    fn overlap_requires_same_file_and_intersecting_lines() {
        let a = SourceLocation::File {
            file: "./src/a.py".into(),
            line: Some(10),
            end_line: Some(20),
        };
        let b = SourceLocation::file("src/a.py", Some(15));
        let c = SourceLocation::file("src/a.py", Some(30));
        let d = SourceLocation::file("src/b.py", Some(15));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&d));
        assert!(SourceLocation::file("src/a.py", None).overlaps(&c));
    }

    #[test]
    fn source_location_json_shapes() {
        let file: SourceLocation =
            serde_json::from_str(r#"{"file":"a.py","line":3}"#).expect("file");
        assert_eq!(file, SourceLocation::file("a.py", Some(3)));
        let ctx: SourceLocation =
            serde_json::from_str(r#"{"context":"module docs"}"#).expect("ctx");
        assert_eq!(ctx, SourceLocation::context("module docs"));
    }

    #[test]
    fn validate_rejects_mismatched_chunk_and_empty_points() {
        let mut result = ChunkResult {
            chunk_id: "c0001".into(),
            status: ResultStatus::Completed,
            findings: vec![Finding {
                point: "uses eval".into(),
                evidence: String::new(),
                confidence: Confidence::High,
                source: SourceLocation::file("a.py", Some(1)),
            }],
            missing_info: Vec::new(),
            partial_answer: None,
        };
        assert!(result.validate("c0001").is_ok());
        assert!(result.validate("c0002").is_err());
        result.findings[0].point = "  ".into();
        assert!(result.validate("c0001").is_err());
    }
}
