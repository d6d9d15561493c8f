use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Failure classes. Each maps to a fixed process exit code so automation can
/// tell them apart without parsing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad input parameters. Never retried.
    Validation,
    /// Malformed persisted or externally returned structured data.
    Parsing,
    /// Size, permission or disk limits.
    Resource,
    /// Invalid settings, reported before any work starts.
    Configuration,
    /// Timeouts, rate limits, internal faults.
    System,
    /// The operator interrupted the run.
    Cancelled,
}

impl ErrorCategory {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Validation => 2,
            Self::Parsing => 3,
            Self::Resource => 4,
            Self::Configuration => 5,
            Self::System => 6,
            Self::Cancelled => 130,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Parsing => "parsing",
            Self::Resource => "resource",
            Self::Configuration => "configuration",
            Self::System => "system",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Implemented by every library error so the CLI can render a stable code, a
/// one-line cause and a remediation hint.
pub trait Classify {
    fn category(&self) -> ErrorCategory;

    /// Stable, lookup-able identifier, e.g. `sandbox.forbidden_pattern`.
    fn code(&self) -> &'static str;

    fn hint(&self) -> Option<String> {
        None
    }

    fn envelope(&self) -> ErrorEnvelope
    where
        Self: std::fmt::Display,
    {
        ErrorEnvelope {
            code: self.code().to_string(),
            category: self.category(),
            message: self.to_string(),
            hint: self.hint(),
        }
    }
}

/// JSON shape of an error on stdout when `--json` is requested.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ErrorEnvelope {
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn exit_codes_are_distinct_and_nonzero() {
        let all = [
            ErrorCategory::Validation,
            ErrorCategory::Parsing,
            ErrorCategory::Resource,
            ErrorCategory::Configuration,
            ErrorCategory::System,
            ErrorCategory::Cancelled,
        ];
        let codes: HashSet<i32> = all.iter().map(|c| c.exit_code()).collect();
        assert_eq!(codes.len(), all.len());
        assert!(!codes.contains(&0));
        assert!(!codes.contains(&1));
    }
}
