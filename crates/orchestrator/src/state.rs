//! Persisted session documents and their load-time invariants.

use crate::phase::Phase;
use chunkwise_protocol::{DeltaReport, STATE_SCHEMA_VERSION};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One span of the context. The span never changes after chunking; only
/// the bookkeeping fields do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChunkRecord {
    pub id: String,
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub status: ChunkStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub escalated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ChunkRecord {
    pub fn size(&self) -> usize {
        self.end - self.start
    }
}

/// One loaded file and where its body sits in `context.txt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FileEntry {
    /// Normalized path relative to the analyzed root
    pub path: String,
    /// Hex SHA-256 of the file contents
    pub sha256: String,
    pub bytes: u64,
    pub lines: usize,
    /// Byte range of the file body in the context
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChunkingRecord {
    pub strategy: String,
    pub size: usize,
    pub overlap: usize,
}

/// Spending against the escalation budget. Persisted so a resumed run
/// cannot exceed it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EscalationLedger {
    pub escalated: usize,
    pub cost_spent: f64,
}

/// `state.json`: the main session document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SessionState {
    pub schema_version: u32,
    pub id: String,
    pub query: String,
    pub root: PathBuf,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub phase: Phase,
    #[serde(default)]
    pub aborted: bool,
    pub context_bytes: usize,
    #[serde(default)]
    pub manifest: Vec<FileEntry>,
    #[serde(default)]
    pub skipped_files: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunking: Option<ChunkingRecord>,
    #[serde(default)]
    pub chunks: Vec<ChunkRecord>,
    /// Sticky once set: dispatch one chunk at a time for the rest of the session
    #[serde(default)]
    pub sequential_fallback: bool,
    #[serde(default)]
    pub consecutive_failing_batches: u32,
    #[serde(default)]
    pub escalation: EscalationLedger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<DeltaReport>,
}

impl SessionState {
    pub fn new(id: String, query: String, root: PathBuf, now_ms: u64) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            id,
            query,
            root,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            phase: Phase::Initialized,
            aborted: false,
            context_bytes: 0,
            manifest: Vec::new(),
            skipped_files: 0,
            chunking: None,
            chunks: Vec::new(),
            sequential_fallback: false,
            consecutive_failing_batches: 0,
            escalation: EscalationLedger::default(),
            base_session: None,
            delta: None,
        }
    }

    pub fn chunk(&self, id: &str) -> Option<&ChunkRecord> {
        self.chunks.iter().find(|c| c.id == id)
    }

    pub fn chunk_mut(&mut self, id: &str) -> Option<&mut ChunkRecord> {
        self.chunks.iter_mut().find(|c| c.id == id)
    }

    pub fn count(&self, status: ChunkStatus) -> usize {
        self.chunks.iter().filter(|c| c.status == status).count()
    }

    pub fn all_terminal(&self) -> bool {
        !self.chunks.is_empty() && self.chunks.iter().all(|c| c.status.is_terminal())
    }

    /// Invariants checked on every load.
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != STATE_SCHEMA_VERSION {
            return Err(format!(
                "schema version {} is not supported (expected {STATE_SCHEMA_VERSION})",
                self.schema_version
            ));
        }
        if self.id.trim().is_empty() {
            return Err("empty session id".to_string());
        }
        let mut seen = HashSet::new();
        for (position, chunk) in self.chunks.iter().enumerate() {
            if !seen.insert(chunk.id.as_str()) {
                return Err(format!("duplicate chunk id {}", chunk.id));
            }
            if chunk.index != position {
                return Err(format!("chunk {} is out of order", chunk.id));
            }
            if chunk.start > chunk.end || chunk.end > self.context_bytes {
                return Err(format!(
                    "chunk {} spans {}..{} outside the {}-byte context",
                    chunk.id, chunk.start, chunk.end, self.context_bytes
                ));
            }
        }
        if self.phase >= Phase::Mapping && self.chunking.is_none() {
            return Err(format!("phase {} but the context was never chunked", self.phase));
        }
        for file in &self.manifest {
            if file.start > file.end || file.end > self.context_bytes {
                return Err(format!("manifest entry {} lies outside the context", file.path));
            }
        }
        Ok(())
    }
}
