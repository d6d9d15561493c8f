use crate::phase::Phase;
use chunkwise_aggregator::AggregatorError;
use chunkwise_chunker::ChunkerError;
use chunkwise_protocol::{Classify, ErrorCategory};
use chunkwise_sandbox::SandboxError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A persisted document parsed but violates its invariants
    #[error("corrupt session data in {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("session `{0}` not found")]
    SessionNotFound(String),

    #[error("no current session; run `init` or `sessions use <id>`")]
    NoCurrentSession,

    #[error("session `{id}` is {phase}; cannot {operation}")]
    InvalidPhase {
        id: String,
        phase: Phase,
        operation: String,
    },

    #[error("session `{0}` was aborted")]
    Aborted(String),

    #[error("session `{0}` is locked by another process")]
    Locked(String),

    #[error("nothing to analyze under {0}")]
    EmptyContext(PathBuf),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("analysis worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("run cancelled ({mode}); {checkpointed} batches checkpointed")]
    Cancelled { mode: String, checkpointed: usize },

    #[error(transparent)]
    Chunker(#[from] ChunkerError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
}

impl OrchestratorError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl Classify for OrchestratorError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::PermissionDenied => ErrorCategory::Resource,
                _ => ErrorCategory::System,
            },
            Self::Json { .. } | Self::Corrupt { .. } => ErrorCategory::Parsing,
            Self::InvalidConfig(_) => ErrorCategory::Configuration,
            Self::SessionNotFound(_)
            | Self::NoCurrentSession
            | Self::InvalidPhase { .. }
            | Self::Aborted(_)
            | Self::EmptyContext(_)
            | Self::InvalidInput(_) => ErrorCategory::Validation,
            Self::LimitExceeded(_) => ErrorCategory::Resource,
            Self::Locked(_) | Self::WorkerUnavailable(_) | Self::Internal(_) => {
                ErrorCategory::System
            }
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
            Self::Chunker(err) => err.category(),
            Self::Sandbox(err) => err.category(),
            Self::Aggregator(err) => err.category(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "session.io",
            Self::Json { .. } => "session.malformed_json",
            Self::Corrupt { .. } => "session.corrupt",
            Self::InvalidConfig(_) => "config.invalid",
            Self::SessionNotFound(_) => "session.not_found",
            Self::NoCurrentSession => "session.no_current",
            Self::InvalidPhase { .. } => "session.invalid_phase",
            Self::Aborted(_) => "session.aborted",
            Self::Locked(_) => "session.locked",
            Self::EmptyContext(_) => "context.empty",
            Self::InvalidInput(_) => "input.invalid",
            Self::LimitExceeded(_) => "context.limit_exceeded",
            Self::WorkerUnavailable(_) => "map.worker_unavailable",
            Self::Internal(_) => "internal",
            Self::Cancelled { .. } => "run.cancelled",
            Self::Chunker(err) => err.code(),
            Self::Sandbox(err) => err.code(),
            Self::Aggregator(err) => err.code(),
        }
    }

    fn hint(&self) -> Option<String> {
        let hint = match self {
            Self::Io { .. } => "Check that the state directory exists and is writable.",
            Self::Json { .. } | Self::Corrupt { .. } => {
                "Resume from the last checkpoint (`chunkwise sessions resume`) or discard the session (`chunkwise sessions clean --id <id>`)."
            }
            Self::InvalidConfig(_) => "Fix chunkwise.toml, CHUNKWISE_* variables or the flags.",
            Self::SessionNotFound(_) => "List sessions with `chunkwise sessions list`.",
            Self::NoCurrentSession => "Start one with `chunkwise init <path> --query ...`.",
            Self::InvalidPhase { .. } => "Run the earlier phase first; `chunkwise status` shows where the session is.",
            Self::Aborted(_) => "Start a new session; aborted sessions keep their data for inspection only.",
            Self::Locked(_) => "Wait for the other run to finish, or cancel it.",
            Self::EmptyContext(_) => "Point init at a directory with text files, or loosen --include/--exclude.",
            Self::InvalidInput(_) => "Check the command arguments.",
            Self::LimitExceeded(_) => "Narrow the input with --include/--exclude or raise the limit in chunkwise.toml.",
            Self::WorkerUnavailable(_) => "Configure an analysis worker with --worker-cmd or [worker] command.",
            Self::Internal(_) => "Re-run with --verbose and report the log.",
            Self::Cancelled { .. } => "Resume later with `chunkwise sessions resume`.",
            Self::Chunker(err) => return err.hint(),
            Self::Sandbox(err) => return err.hint(),
            Self::Aggregator(err) => return err.hint(),
        };
        Some(hint.to_string())
    }
}
