//! Reduce-phase merging of per-chunk analysis results.
//!
//! - near-duplicate claims (Jaccard over word tokens, inclusive threshold)
//!   fold into one finding, with prefix filtering to avoid all-pairs work;
//! - findings about overlapping locations with opposite polarity are flagged
//!   for review;
//! - under incremental re-analysis, findings about deleted files are dropped
//!   and base-session findings about modified files are superseded.

mod aggregate;
pub mod contradiction;
pub mod dedup;
mod error;
mod report;
pub mod tokens;

pub use aggregate::{AggregateInput, Aggregator, AggregatorConfig};
pub use contradiction::Contradiction;
pub use error::{AggregatorError, Result};
pub use report::{AggregateReport, AggregateStats, MergedFinding, Occurrence, PartialAnswer};
