//! # Chunkwise Chunker
//!
//! Splits a session's context document into ordered, optionally overlapping
//! byte spans that are dispatched one by one to analysis workers.
//!
//! ## Guarantees
//!
//! For every `0 <= overlap < size` the produced spans:
//! - start at offset 0 and end at the end of the text,
//! - leave no gaps (`next.start <= prev.end`),
//! - overlap by at most `overlap` bytes,
//! - always start and end on `char` boundaries,
//! - strictly advance (`next.start > prev.start`).
//!
//! ## Producers
//!
//! ```text
//! context.txt
//!     │
//!     ├──> FixedSizeProducer      (size/overlap windows, optional line alignment)
//!     │
//!     └──> StructureAwareProducer (ends snapped to file headers and top-level
//!                                  syntax items via tree-sitter, falling back
//!                                  to fixed windows)
//! ```
//!
//! ## Example
//!
//! ```rust
//! use chunkwise_chunker::{BoundaryProducer, ChunkerConfig, FixedSizeProducer};
//!
//! let config = ChunkerConfig { size: 16, overlap: 4, ..ChunkerConfig::default() };
//! let producer = FixedSizeProducer::new(config).unwrap();
//! let spans = producer.spans("fn main() { println!(\"hi\"); }", None).unwrap();
//! assert_eq!(spans.first().map(|s| s.start), Some(0));
//! ```

mod config;
mod error;
mod fixed;
mod language;
mod sections;
mod span;
mod structure;

pub use config::{chunk_timeout_for, ChunkerConfig, ChunkingStrategy};
pub use error::{ChunkerError, Result};
pub use fixed::FixedSizeProducer;
pub use language::Language;
pub use sections::{parse_sections, render_section_header, ContextSection, FILE_HEADER_PREFIX};
pub use span::Span;
pub use structure::StructureAwareProducer;

use std::time::Instant;

/// Produces ordered spans over a text. Implementations must uphold the
/// coverage and overlap guarantees documented at the crate root.
pub trait BoundaryProducer: Send + Sync {
    fn spans(&self, text: &str, deadline: Option<Instant>) -> Result<Vec<Span>>;
}

/// Build the producer selected by `config.strategy`.
pub fn producer_for(config: &ChunkerConfig) -> Result<Box<dyn BoundaryProducer>> {
    Ok(match config.strategy {
        ChunkingStrategy::Fixed => Box::new(FixedSizeProducer::new(config.clone())?),
        ChunkingStrategy::Structure => Box::new(StructureAwareProducer::new(config.clone())?),
    })
}
