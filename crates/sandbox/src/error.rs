use chunkwise_protocol::{Classify, ErrorCategory};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Python-style name of a failure raised while evaluating an allowed program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum RuntimeKind {
    NameError,
    TypeError,
    ValueError,
    IndexError,
    KeyError,
    ZeroDivisionError,
    AttributeError,
    OverflowError,
}

impl RuntimeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NameError => "NameError",
            Self::TypeError => "TypeError",
            Self::ValueError => "ValueError",
            Self::IndexError => "IndexError",
            Self::KeyError => "KeyError",
            Self::ZeroDivisionError => "ZeroDivisionError",
            Self::AttributeError => "AttributeError",
            Self::OverflowError => "OverflowError",
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every way an evaluation or search can fail. Serializable because the
/// isolated worker reports failures over its stdout pipe.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SandboxError {
    /// Source text matched a banned capability pattern
    #[error("forbidden pattern `{pattern}`: {reason}")]
    ForbiddenPattern { pattern: String, reason: String },

    /// Program contains a syntax node outside the allow-list
    #[error("forbidden construct `{node}` at line {line}")]
    ForbiddenNode { node: String, line: usize },

    /// Private or reflective attribute, found statically or at run time
    #[error("forbidden attribute `{name}` at line {line}")]
    ForbiddenAttribute { name: String, line: usize },

    #[error("evaluation exceeded its {limit_ms} ms time limit")]
    Timeout { limit_ms: u64 },

    /// Worker response exceeded the transport cap
    #[error("worker response exceeded {limit} bytes")]
    OutputTooLarge { limit: usize },

    #[error("parse error at line {line}, column {column}: {message}")]
    ParseError {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("{error}: {message} (line {line})")]
    Runtime {
        error: RuntimeKind,
        message: String,
        line: usize,
    },

    #[error("resource limit exceeded: {limit}")]
    ResourceExceeded { limit: String },

    #[error("search pattern rejected: {reason}")]
    RejectedPattern { reason: String },

    #[error("invalid search pattern: {message}")]
    InvalidPattern { message: String },

    #[error("sandbox worker failed: {message}")]
    Worker { message: String },

    #[error("sandbox misconfigured: {message}")]
    Configuration { message: String },
}

impl SandboxError {
    pub(crate) fn runtime(error: RuntimeKind, message: impl Into<String>) -> Self {
        Self::Runtime {
            error,
            message: message.into(),
            line: 0,
        }
    }

    pub(crate) fn type_error(message: impl Into<String>) -> Self {
        Self::runtime(RuntimeKind::TypeError, message)
    }

    pub(crate) fn value_error(message: impl Into<String>) -> Self {
        Self::runtime(RuntimeKind::ValueError, message)
    }

    pub(crate) fn resource(limit: impl Into<String>) -> Self {
        Self::ResourceExceeded {
            limit: limit.into(),
        }
    }

    pub(crate) fn worker(message: impl Into<String>) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Attach a source line to errors raised below the statement level.
    pub(crate) fn at_line(self, at: usize) -> Self {
        match self {
            Self::Runtime {
                error,
                message,
                line: 0,
            } => Self::Runtime {
                error,
                message,
                line: at,
            },
            Self::ForbiddenAttribute { name, line: 0 } => Self::ForbiddenAttribute { name, line: at },
            other => other,
        }
    }

    /// Rejected by one of the static or run-time gates.
    pub fn is_gate_rejection(&self) -> bool {
        matches!(
            self,
            Self::ForbiddenPattern { .. } | Self::ForbiddenNode { .. } | Self::ForbiddenAttribute { .. }
        )
    }
}

impl Classify for SandboxError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::ForbiddenPattern { .. }
            | Self::ForbiddenNode { .. }
            | Self::ForbiddenAttribute { .. }
            | Self::ParseError { .. }
            | Self::Runtime { .. }
            | Self::RejectedPattern { .. }
            | Self::InvalidPattern { .. } => ErrorCategory::Validation,
            Self::OutputTooLarge { .. } | Self::ResourceExceeded { .. } => ErrorCategory::Resource,
            Self::Timeout { .. } | Self::Worker { .. } => ErrorCategory::System,
            Self::Configuration { .. } => ErrorCategory::Configuration,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::ForbiddenPattern { .. } => "sandbox.forbidden_pattern",
            Self::ForbiddenNode { .. } => "sandbox.forbidden_node",
            Self::ForbiddenAttribute { .. } => "sandbox.forbidden_attribute",
            Self::Timeout { .. } => "sandbox.timeout",
            Self::OutputTooLarge { .. } => "sandbox.output_too_large",
            Self::ParseError { .. } => "sandbox.parse_error",
            Self::Runtime { .. } => "sandbox.runtime",
            Self::ResourceExceeded { .. } => "sandbox.resource_exceeded",
            Self::RejectedPattern { .. } => "search.rejected_pattern",
            Self::InvalidPattern { .. } => "search.invalid_pattern",
            Self::Worker { .. } => "sandbox.worker",
            Self::Configuration { .. } => "sandbox.configuration",
        }
    }

    fn hint(&self) -> Option<String> {
        let hint = match self {
            Self::ForbiddenPattern { .. } => {
                "Only data helpers and safe builtins are available; rewrite without that capability."
            }
            Self::ForbiddenNode { .. } => {
                "Use expressions, assignments, loops and conditionals; definitions, imports and exception handling are not allowed."
            }
            Self::ForbiddenAttribute { .. } => {
                "Attributes starting with `_` and reflective internals are not accessible."
            }
            Self::Timeout { .. } => "Narrow the input with peek()/lines() or raise eval_timeout_ms.",
            Self::OutputTooLarge { .. } => "Return a smaller value, e.g. slice it or count it.",
            Self::ParseError { .. } => "Check the expression syntax.",
            Self::Runtime { .. } => "Fix the expression; the session is unaffected.",
            Self::ResourceExceeded { .. } => "Work on smaller slices of the context.",
            Self::RejectedPattern { .. } => {
                "Avoid nested unbounded quantifiers, duplicate alternatives and stacked `.*`."
            }
            Self::InvalidPattern { .. } => "Check the regular expression syntax.",
            Self::Worker { .. } => "Check that the sandbox worker executable is installed and runnable.",
            Self::Configuration { .. } => "Fix the [sandbox] section of chunkwise.toml.",
        };
        Some(hint.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_errors_pick_up_lines_once() {
        let err = SandboxError::type_error("bad operand").at_line(3).at_line(9);
        assert!(matches!(err, SandboxError::Runtime { line: 3, .. }));
        assert_eq!(err.to_string(), "TypeError: bad operand (line 3)");
    }

    #[test]
    fn errors_survive_the_wire() {
        let err = SandboxError::ForbiddenAttribute {
            name: "__class__".into(),
            line: 2,
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"forbidden_attribute\""));
        let back: SandboxError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
