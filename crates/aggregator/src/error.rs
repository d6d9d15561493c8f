use chunkwise_protocol::{Classify, ErrorCategory};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AggregatorError>;

#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("invalid aggregator config: {0}")]
    InvalidConfig(String),

    #[error("failed to render report: {0}")]
    Render(#[from] serde_json::Error),
}

impl Classify for AggregatorError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidConfig(_) => ErrorCategory::Configuration,
            Self::Render(_) => ErrorCategory::System,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "aggregate.invalid_config",
            Self::Render(_) => "aggregate.render",
        }
    }

    fn hint(&self) -> Option<String> {
        match self {
            Self::InvalidConfig(_) => {
                Some("Similarity thresholds must lie in (0, 1]; check [aggregate] in chunkwise.toml.".to_string())
            }
            Self::Render(_) => None,
        }
    }
}
