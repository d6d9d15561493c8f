use crate::error::{OrchestratorError, Result};
use crate::phase::Phase;
use crate::state::{ChunkStatus, SessionState};
use crate::store::{read_json, write_json_atomic};
use chunkwise_protocol::{unix_now_ms, STATE_SCHEMA_VERSION};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Durable resume point, written after every mapping batch. Holds chunk ids
/// only; the results themselves live in `results/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub session_id: String,
    /// Index of the last batch whose outcomes are recorded
    pub batch_index: usize,
    /// Chunks with a usable recorded result
    pub completed: BTreeSet<String>,
    pub phase: Phase,
    pub written_at_ms: u64,
}

impl Checkpoint {
    /// Snapshot of `state` after `batch_index`.
    pub fn capture(state: &SessionState, batch_index: usize) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            session_id: state.id.clone(),
            batch_index,
            completed: state
                .chunks
                .iter()
                .filter(|c| c.status == ChunkStatus::Completed)
                .map(|c| c.id.clone())
                .collect(),
            phase: state.phase,
            written_at_ms: unix_now_ms(),
        }
    }

    pub fn validate(&self, state: &SessionState) -> std::result::Result<(), String> {
        if self.schema_version != STATE_SCHEMA_VERSION {
            return Err(format!(
                "schema version {} is not supported (expected {STATE_SCHEMA_VERSION})",
                self.schema_version
            ));
        }
        if self.session_id != state.id {
            return Err(format!("checkpoint belongs to session {}", self.session_id));
        }
        if let Some(unknown) = self.completed.iter().find(|id| state.chunk(id).is_none()) {
            return Err(format!("checkpoint references unknown chunk {unknown}"));
        }
        Ok(())
    }
}

/// Reads and replaces one session's `checkpoint.json`.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    path: PathBuf,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Replace the checkpoint. Until the rename lands the previous one
    /// stays readable.
    pub async fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        write_json_atomic(&self.path, checkpoint).await?;
        log::debug!(
            "checkpoint batch {} ({} completed) -> {}",
            checkpoint.batch_index,
            checkpoint.completed.len(),
            self.path.display()
        );
        Ok(())
    }

    /// `Ok(None)` before the first batch finished.
    pub async fn load(&self, state: &SessionState) -> Result<Option<Checkpoint>> {
        let Some(checkpoint) = read_json::<Checkpoint>(&self.path).await? else {
            return Ok(None);
        };
        checkpoint
            .validate(state)
            .map_err(|message| OrchestratorError::corrupt(&self.path, message))?;
        Ok(Some(checkpoint))
    }

    /// Batch index the next mapping batch should use.
    pub async fn next_batch_index(&self, state: &SessionState) -> Result<usize> {
        Ok(self.load(state).await?.map_or(0, |c| c.batch_index + 1))
    }
}
