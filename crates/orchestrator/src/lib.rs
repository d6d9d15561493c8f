//! # Chunkwise Orchestrator
//!
//! Drives one analysis session from a directory tree to an aggregated report.
//!
//! ## Pipeline
//!
//! ```text
//! init      ──> context.txt + manifest (.gitignore aware, sha256 per file)
//!   │
//! explore   ──> sandboxed eval / search over the context   (scouting)
//!   │
//! chunk     ──> chunks/<id>.txt                             (chunking)
//!   │
//! map       ──> results/<id>.json, checkpoint per batch     (mapping)
//!   │
//! reduce    ──> report.json                                 (reducing -> completed)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use chunkwise_orchestrator::{
//!     CancellationManager, CommandWorker, InitOptions, MapOptions, Orchestrator,
//!     OrchestratorConfig, Workers,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = OrchestratorConfig::default();
//!     let orchestrator = Orchestrator::new(config, ".chunkwise")?;
//!     orchestrator
//!         .init(InitOptions {
//!             root: "src".into(),
//!             query: "where is the retry policy applied?".into(),
//!             ..InitOptions::default()
//!         })
//!         .await?;
//!     orchestrator.chunk(None).await?;
//!
//!     let worker = CommandWorker::from_argv(&["./analyze.sh".to_string()]).expect("worker");
//!     let workers = Workers { standard: Arc::new(worker), escalated: None };
//!     orchestrator
//!         .map(None, MapOptions::default(), &workers, &CancellationManager::default())
//!         .await?;
//!     let report = orchestrator.reduce(None).await?;
//!     println!("{}", report.to_markdown());
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod dispatch;
mod error;
mod orchestrator;
pub mod phase;
pub mod progress;
pub mod retry;
pub mod state;
pub mod store;
pub mod worker;

pub use cancel::{CancelMode, CancellationManager};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use config::{OrchestratorConfig, CONFIG_FILE_NAME, ENV_PREFIX};
pub use error::{OrchestratorError, Result};
pub use orchestrator::{
    ChunkSummary, ExportFormat, InitOptions, InitSummary, MapOptions, MapSummary, Orchestrator,
    StatusReport, Workers,
};
pub use phase::Phase;
pub use progress::{ProgressEvent, ProgressKind};
pub use retry::RetryPolicy;
pub use state::{ChunkRecord, ChunkStatus, SessionState};
pub use store::{CleanReport, SessionStore, SessionSummary, DEFAULT_STATE_DIR};
pub use worker::{AnalysisRequest, AnalysisWorker, CommandWorker, DispatchError, WorkerTier};
