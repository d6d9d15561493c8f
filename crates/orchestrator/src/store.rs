//! On-disk session layout:
//!
//! ```text
//! <state_dir>/
//!   chunkwise.toml
//!   current                      id of the current session
//!   sessions/<id>/
//!     state.json                 SessionState
//!     checkpoint.json            Checkpoint
//!     context.txt                concatenated file sections
//!     chunks/<chunk_id>.txt
//!     results/<chunk_id>.json    ChunkResult
//!     report.json                AggregateReport
//!     progress.jsonl             ProgressEvent per line
//!     session.lock
//! ```
//!
//! Every JSON document is replaced atomically (temporary file, fsync,
//! rename), so a reader sees either the previous or the new version.

use crate::config::GcPolicy;
use crate::error::{OrchestratorError, Result};
use crate::phase::Phase;
use crate::progress::ProgressEvent;
use crate::state::{ChunkStatus, SessionState};
use chunkwise_protocol::{unix_now_ms, ChunkResult};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const DEFAULT_STATE_DIR: &str = ".chunkwise";

const SESSIONS_DIR: &str = "sessions";
const CURRENT_FILE: &str = "current";
const STATE_FILE: &str = "state.json";
const CHECKPOINT_FILE: &str = "checkpoint.json";
const CONTEXT_FILE: &str = "context.txt";
const CHUNKS_DIR: &str = "chunks";
const RESULTS_DIR: &str = "results";
const REPORT_FILE: &str = "report.json";
const PROGRESS_FILE: &str = "progress.jsonl";
const LOCK_FILE: &str = "session.lock";

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Paths inside one session directory.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    dir: PathBuf,
}

impl SessionPaths {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    pub fn context(&self) -> PathBuf {
        self.dir.join(CONTEXT_FILE)
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.dir.join(CHUNKS_DIR)
    }

    pub fn chunk(&self, chunk_id: &str) -> PathBuf {
        self.chunks_dir().join(format!("{chunk_id}.txt"))
    }

    pub fn results_dir(&self) -> PathBuf {
        self.dir.join(RESULTS_DIR)
    }

    pub fn result(&self, chunk_id: &str) -> PathBuf {
        self.results_dir().join(format!("{chunk_id}.json"))
    }

    pub fn report(&self) -> PathBuf {
        self.dir.join(REPORT_FILE)
    }

    pub fn progress(&self) -> PathBuf {
        self.dir.join(PROGRESS_FILE)
    }

    fn lock(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }
}

/// Exclusive write access to one session, released on drop.
pub struct SessionLock {
    file: std::fs::File,
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// One row of `sessions list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub query: String,
    pub phase: Phase,
    pub aborted: bool,
    pub current: bool,
    pub chunks: usize,
    pub completed: usize,
    pub failed: usize,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanReport {
    pub removed: Vec<String>,
    pub freed_bytes: u64,
    /// Sessions kept because another process holds their lock
    pub skipped_locked: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    state_dir: PathBuf,
}

impl SessionStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join(SESSIONS_DIR)
    }

    pub fn paths(&self, id: &str) -> Result<SessionPaths> {
        validate_session_id(id)?;
        Ok(SessionPaths {
            dir: self.sessions_dir().join(id),
        })
    }

    pub fn exists(&self, id: &str) -> bool {
        self.paths(id).map(|p| p.state().is_file()).unwrap_or(false)
    }

    /// Create the directory tree for a new session.
    pub async fn create(&self, id: &str) -> Result<SessionPaths> {
        let paths = self.paths(id)?;
        for dir in [paths.chunks_dir(), paths.results_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| OrchestratorError::io(&dir, e))?;
        }
        Ok(paths)
    }

    /// Take the session's write lock without waiting.
    pub fn lock(&self, id: &str) -> Result<SessionLock> {
        let paths = self.paths(id)?;
        if !paths.dir().is_dir() {
            return Err(OrchestratorError::SessionNotFound(id.to_string()));
        }
        let path = paths.lock();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| OrchestratorError::io(&path, e))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(SessionLock { file }),
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(OrchestratorError::Locked(id.to_string()))
            }
            Err(err) => Err(OrchestratorError::io(&path, err)),
        }
    }

    pub async fn load_state(&self, id: &str) -> Result<SessionState> {
        let path = self.paths(id)?.state();
        let state: SessionState = match read_json(&path).await? {
            Some(state) => state,
            None => return Err(OrchestratorError::SessionNotFound(id.to_string())),
        };
        state
            .validate()
            .map_err(|message| OrchestratorError::corrupt(&path, message))?;
        if state.id != id {
            return Err(OrchestratorError::corrupt(
                &path,
                format!("document belongs to session {}", state.id),
            ));
        }
        Ok(state)
    }

    pub async fn save_state(&self, state: &mut SessionState) -> Result<()> {
        state.updated_at_ms = unix_now_ms().max(state.updated_at_ms);
        write_json_atomic(&self.paths(&state.id)?.state(), state).await
    }

    /// Record a chunk result, replacing any earlier result for that chunk.
    pub async fn write_result(&self, id: &str, result: &ChunkResult) -> Result<()> {
        write_json_atomic(&self.paths(id)?.result(&result.chunk_id), result).await
    }

    pub async fn read_result(&self, id: &str, chunk_id: &str) -> Result<Option<ChunkResult>> {
        read_json(&self.paths(id)?.result(chunk_id)).await
    }

    /// Results of every finished chunk, in chunk order.
    pub async fn read_results(&self, state: &SessionState) -> Result<Vec<ChunkResult>> {
        let paths = self.paths(&state.id)?;
        let mut results = Vec::with_capacity(state.chunks.len());
        for chunk in state.chunks.iter().filter(|c| c.status.is_terminal()) {
            let path = paths.result(&chunk.id);
            let Some(result) = read_json::<ChunkResult>(&path).await? else {
                return Err(OrchestratorError::corrupt(
                    &path,
                    format!("chunk {} is {:?} but has no result", chunk.id, chunk.status),
                ));
            };
            result
                .validate(&chunk.id)
                .map_err(|message| OrchestratorError::corrupt(&path, message))?;
            results.push(result);
        }
        Ok(results)
    }

    pub async fn append_progress(&self, id: &str, event: &ProgressEvent) -> Result<()> {
        let path = self.paths(id)?.progress();
        let mut line = serde_json::to_vec(event).map_err(|e| OrchestratorError::json(&path, e))?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| OrchestratorError::io(&path, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| OrchestratorError::io(&path, e))?;
        file.flush().await.map_err(|e| OrchestratorError::io(&path, e))
    }

    pub async fn read_progress(&self, id: &str) -> Result<Vec<ProgressEvent>> {
        let path = self.paths(id)?.progress();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(OrchestratorError::io(&path, err)),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(|e| OrchestratorError::json(&path, e)))
            .collect()
    }

    pub async fn set_current(&self, id: &str) -> Result<()> {
        validate_session_id(id)?;
        let path = self.state_dir.join(CURRENT_FILE);
        write_bytes_atomic(&path, format!("{id}\n").as_bytes()).await
    }

    /// Read the current-session marker. Always hits the disk.
    pub async fn current(&self) -> Result<Option<String>> {
        let path = self.state_dir.join(CURRENT_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let id = raw.trim();
                if id.is_empty() || validate_session_id(id).is_err() {
                    log::warn!("ignoring malformed current-session marker {}", path.display());
                    return Ok(None);
                }
                Ok(Some(id.to_string()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(OrchestratorError::io(&path, err)),
        }
    }

    async fn clear_current_if(&self, id: &str) -> Result<()> {
        if self.current().await?.as_deref() == Some(id) {
            let path = self.state_dir.join(CURRENT_FILE);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(OrchestratorError::io(&path, err)),
            }
        }
        Ok(())
    }

    /// Every session with a readable state document, oldest first.
    /// Unreadable sessions are logged and skipped.
    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        let dir = self.sessions_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(OrchestratorError::io(&dir, err)),
        };
        let current = self.current().await?;
        let mut sessions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| OrchestratorError::io(&dir, e))?
        {
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_session_id(&id).is_err() {
                continue;
            }
            let state = match self.load_state(&id).await {
                Ok(state) => state,
                Err(err) => {
                    log::warn!("skipping session {id}: {err}");
                    continue;
                }
            };
            sessions.push(SessionSummary {
                current: current.as_deref() == Some(id.as_str()),
                chunks: state.chunks.len(),
                completed: state.count(ChunkStatus::Completed),
                failed: state.count(ChunkStatus::Failed),
                bytes: dir_size(&entry.path()),
                id,
                query: state.query,
                phase: state.phase,
                aborted: state.aborted,
                created_at_ms: state.created_at_ms,
                updated_at_ms: state.updated_at_ms,
            });
        }
        sessions.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    /// Remove one session's directory. Refuses while it is locked.
    pub async fn delete(&self, id: &str) -> Result<u64> {
        let paths = self.paths(id)?;
        if !paths.dir().is_dir() {
            return Err(OrchestratorError::SessionNotFound(id.to_string()));
        }
        // Held until the directory is gone so no other run can claim it.
        let lock = self.lock(id)?;
        let bytes = dir_size(paths.dir());
        tokio::fs::remove_dir_all(paths.dir())
            .await
            .map_err(|e| OrchestratorError::io(paths.dir(), e))?;
        drop(lock);
        self.clear_current_if(id).await?;
        log::info!("removed session {id} ({bytes} bytes)");
        Ok(bytes)
    }

    /// Apply the age cap, then the total-size cap (oldest first). The
    /// current session and locked sessions are never collected.
    pub async fn gc(&self, policy: &GcPolicy, now_ms: u64) -> Result<CleanReport> {
        let mut report = CleanReport::default();
        let sessions = self.list().await?;
        let max_age_ms = policy.max_age_days.saturating_mul(DAY_MS);
        let mut total: u64 = sessions.iter().map(|s| s.bytes).sum();

        for session in &sessions {
            if session.current {
                continue;
            }
            let expired = now_ms.saturating_sub(session.updated_at_ms) > max_age_ms;
            let over_budget = total > policy.max_total_bytes;
            if !expired && !over_budget {
                continue;
            }
            match self.delete(&session.id).await {
                Ok(bytes) => {
                    total = total.saturating_sub(bytes);
                    report.freed_bytes += bytes;
                    report.removed.push(session.id.clone());
                }
                Err(OrchestratorError::Locked(id)) => report.skipped_locked.push(id),
                Err(err) => return Err(err),
            }
        }
        Ok(report)
    }
}

/// Session ids become directory names, so only a conservative alphabet is
/// accepted.
pub fn validate_session_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidInput(format!("invalid session id {id:?}")))
    }
}

/// `s<unix ms hex>-<8 random hex digits>`.
pub fn new_session_id() -> Result<String> {
    Ok(format!("s{:x}-{}", unix_now_ms(), random_hex::<4>()?))
}

fn random_hex<const N: usize>() -> Result<String> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes).map_err(|e| {
        OrchestratorError::io(
            "getrandom",
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        )
    })?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

pub(crate) async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| OrchestratorError::json(path, e))?;
    write_bytes_atomic(path, &bytes).await
}

pub(crate) async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| OrchestratorError::io(parent, e))?;
    }
    // Unique per writer: concurrent writers of the same path must not share
    // a temporary file.
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(format!(".{}.{}.tmp", std::process::id(), random_hex::<6>()?));
    let tmp = PathBuf::from(tmp_name);

    let written = write_then_rename(&tmp, path, bytes).await;
    if written.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    written
}

async fn write_then_rename(tmp: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = tokio::fs::File::create(tmp)
        .await
        .map_err(|e| OrchestratorError::io(tmp, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| OrchestratorError::io(tmp, e))?;
    file.sync_all().await.map_err(|e| OrchestratorError::io(tmp, e))?;
    drop(file);
    tokio::fs::rename(tmp, path)
        .await
        .map_err(|e| OrchestratorError::io(path, e))
}

/// `Ok(None)` when the file does not exist.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(OrchestratorError::io(path, err)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| OrchestratorError::json(path, e))
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.file_type() {
            Ok(kind) if kind.is_dir() => dir_size(&entry.path()),
            Ok(_) => entry.metadata().map(|m| m.len()).unwrap_or(0),
            Err(_) => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn seeded(store: &SessionStore, id: &str, updated_at_ms: u64) {
        store.create(id).await.unwrap();
        let state = SessionState::new(id.into(), "q".into(), PathBuf::from("."), updated_at_ms);
        write_json_atomic(&store.paths(id).unwrap().state(), &state).await.unwrap();
    }

    #[test]
    fn session_ids_are_path_safe() {
        assert!(validate_session_id("s18c2-0a1b2c3d").is_ok());
        assert!(validate_session_id("../etc").is_err());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("a/b").is_err());
        let id = new_session_id().unwrap();
        assert!(validate_session_id(&id).is_ok());
        assert_ne!(id, new_session_id().unwrap());
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_json_atomic(&path, &vec![1, 2, 3]).await.unwrap();
        write_json_atomic(&path, &vec![4]).await.unwrap();
        let back: Option<Vec<u32>> = read_json(&path).await.unwrap();
        assert_eq!(back, Some(vec![4]));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["doc.json".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_current_markers_never_fail_or_tear() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(SessionStore::new(dir.path()));
        for round in 0..20 {
            let mut writers = tokio::task::JoinSet::new();
            for writer in 0..8 {
                let store = std::sync::Arc::clone(&store);
                writers.spawn(async move { store.set_current(&format!("s{round}-{writer}")).await });
            }
            let reader = {
                let store = std::sync::Arc::clone(&store);
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    for _ in 0..8 {
                        seen.push(store.current().await.unwrap());
                        tokio::task::yield_now().await;
                    }
                    seen
                })
            };
            while let Some(joined) = writers.join_next().await {
                joined.unwrap().unwrap();
            }
            let seen = reader.await.unwrap();
            if round > 0 {
                assert!(seen.iter().all(Option::is_some), "marker vanished: {seen:?}");
            }
            let current = store.current().await.unwrap().unwrap();
            assert!(current.starts_with(&format!("s{round}-")));
        }
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn current_marker_round_trips_and_clears_on_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert_eq!(store.current().await.unwrap(), None);
        seeded(&store, "s1", 1).await;
        store.set_current("s1").await.unwrap();
        assert_eq!(store.current().await.unwrap().as_deref(), Some("s1"));
        store.delete("s1").await.unwrap();
        assert_eq!(store.current().await.unwrap(), None);
        assert!(matches!(
            store.load_state("s1").await,
            Err(OrchestratorError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn second_lock_is_refused_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        seeded(&store, "s1", 1).await;
        let held = store.lock("s1").unwrap();
        assert!(matches!(store.lock("s1"), Err(OrchestratorError::Locked(_))));
        drop(held);
        assert!(store.lock("s1").is_ok());
    }

    #[tokio::test]
    async fn delete_refuses_a_locked_session_and_leaves_nothing_to_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        seeded(&store, "s1", 1).await;

        let held = store.lock("s1").unwrap();
        assert!(matches!(store.delete("s1").await, Err(OrchestratorError::Locked(_))));
        assert!(store.paths("s1").unwrap().dir().is_dir());
        drop(held);

        store.delete("s1").await.unwrap();
        assert!(!store.paths("s1").unwrap().dir().exists());
        assert!(matches!(
            store.lock("s1"),
            Err(OrchestratorError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn gc_respects_age_and_keeps_current() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let now = 100 * DAY_MS;
        seeded(&store, "old", now - 40 * DAY_MS).await;
        seeded(&store, "old-current", now - 40 * DAY_MS).await;
        seeded(&store, "fresh", now - DAY_MS).await;
        store.set_current("old-current").await.unwrap();

        let report = store.gc(&GcPolicy::default(), now).await.unwrap();
        assert_eq!(report.removed, vec!["old".to_string()]);
        let left: Vec<String> = store.list().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(left, vec!["old-current".to_string(), "fresh".to_string()]);
    }

    #[tokio::test]
    async fn corrupt_state_is_a_parsing_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.create("s1").await.unwrap();
        tokio::fs::write(store.paths("s1").unwrap().state(), b"{ not json")
            .await
            .unwrap();
        let err = store.load_state("s1").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Json { .. }));
    }
}
