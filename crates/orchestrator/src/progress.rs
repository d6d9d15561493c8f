//! `progress.jsonl` events. One JSON object per line, append-only.

use crate::phase::Phase;
use chunkwise_protocol::unix_now_ms;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProgressEvent {
    pub at_ms: u64,
    #[serde(flatten)]
    pub kind: ProgressKind,
}

impl ProgressEvent {
    pub fn now(kind: ProgressKind) -> Self {
        Self {
            at_ms: unix_now_ms(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressKind {
    SessionCreated {
        query: String,
        files: usize,
        context_bytes: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_session: Option<String>,
    },
    PhaseChanged {
        from: Phase,
        to: Phase,
    },
    BatchStarted {
        batch_index: usize,
        chunk_ids: Vec<String>,
        sequential: bool,
    },
    ChunkCompleted {
        chunk_id: String,
        attempts: u32,
        findings: usize,
    },
    ChunkFailed {
        chunk_id: String,
        attempts: u32,
        reason: String,
    },
    ChunkEscalated {
        chunk_id: String,
        succeeded: bool,
        cost_spent: f64,
    },
    FallbackSequential {
        batch_index: usize,
        consecutive_failing_batches: u32,
    },
    CheckpointWritten {
        batch_index: usize,
        completed: usize,
    },
    CancelRequested {
        mode: String,
    },
    SessionCompleted {
        findings: usize,
        contradictions: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_flat_tagged_objects() {
        let event = ProgressEvent {
            at_ms: 42,
            kind: ProgressKind::PhaseChanged {
                from: Phase::Chunking,
                to: Phase::Mapping,
            },
        };
        let line = serde_json::to_string(&event).unwrap();
        assert_eq!(
            line,
            r#"{"at_ms":42,"event":"phase_changed","from":"chunking","to":"mapping"}"#
        );
        let back: ProgressEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back, event);
    }
}
