use chunkwise_protocol::{Classify, ErrorCategory};
use thiserror::Error;

/// Result type for chunker operations
pub type Result<T> = std::result::Result<T, ChunkerError>;

/// Errors that can occur while producing spans
#[derive(Error, Debug)]
pub enum ChunkerError {
    /// Invalid configuration
    #[error("Invalid chunker configuration: {0}")]
    InvalidConfig(String),

    /// Empty content
    #[error("Empty content provided")]
    EmptyContent,

    /// The producer would emit more spans than allowed
    #[error("Chunk limit exceeded: {produced} spans > max_chunks={limit}")]
    TooManyChunks { produced: usize, limit: usize },

    /// Span production ran past its deadline
    #[error("Chunking did not finish before its deadline")]
    DeadlineExceeded,

    /// Tree-sitter error
    #[error("Tree-sitter error: {0}")]
    TreeSitterError(String),
}

impl ChunkerError {
    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a tree-sitter error
    pub fn tree_sitter(msg: impl Into<String>) -> Self {
        Self::TreeSitterError(msg.into())
    }
}

impl Classify for ChunkerError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidConfig(_) => ErrorCategory::Configuration,
            Self::EmptyContent => ErrorCategory::Validation,
            Self::TooManyChunks { .. } => ErrorCategory::Resource,
            Self::DeadlineExceeded | Self::TreeSitterError(_) => ErrorCategory::System,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "chunker.invalid_config",
            Self::EmptyContent => "chunker.empty_content",
            Self::TooManyChunks { .. } => "chunker.too_many_chunks",
            Self::DeadlineExceeded => "chunker.timeout",
            Self::TreeSitterError(_) => "chunker.tree_sitter",
        }
    }

    fn hint(&self) -> Option<String> {
        Some(
            match self {
                Self::InvalidConfig(_) => "Pick a chunk size > 0 and an overlap smaller than the size.",
                Self::EmptyContent => "The session context is empty; re-run init on a path with readable text files.",
                Self::TooManyChunks { .. } => "Increase --chunk-size or raise max_chunks in chunkwise.toml.",
                Self::DeadlineExceeded => "Retry with the fixed strategy or a larger chunk size.",
                Self::TreeSitterError(_) => "Retry with --strategy fixed.",
            }
            .to_string(),
        )
    }
}
