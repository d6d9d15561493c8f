//! Types shared by every chunkwise crate: what an analysis worker returns for a
//! chunk, how findings point back at source, and how failures are categorised
//! for exit codes and remediation hints.

mod category;
mod delta;
pub mod path_filters;
mod result;

pub use category::{Classify, ErrorCategory, ErrorEnvelope};
pub use delta::DeltaReport;
pub use result::{ChunkResult, Confidence, Finding, ResultStatus, SourceLocation};

/// Version stamped into every persisted JSON document.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Unix time in milliseconds, saturating instead of failing on clock skew.
pub fn unix_now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Render the JSON schema of a persisted or exchanged document.
pub fn schema_json<T: schemars::JsonSchema>() -> serde_json::Result<String> {
    let schema = schemars::schema_for!(T);
    serde_json::to_string_pretty(&schema)
}
