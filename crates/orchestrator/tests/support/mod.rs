#![allow(dead_code)]

use async_trait::async_trait;
use chunkwise_orchestrator::{
    AnalysisRequest, AnalysisWorker, DispatchError, InitOptions, Orchestrator, OrchestratorConfig,
    RetryPolicy, Workers,
};
use chunkwise_protocol::{ChunkResult, Confidence, Finding, ResultStatus, SourceLocation};
use chunkwise_sandbox::IsolationMode;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

type Script = dyn Fn(&AnalysisRequest) -> Result<ChunkResult, DispatchError> + Send + Sync;

/// In-memory analysis worker driven by a closure. Records every call with
/// the number of calls running when it started.
pub struct ScriptedWorker {
    script: Box<Script>,
    delay: Duration,
    running: AtomicUsize,
    calls: Mutex<Vec<(String, usize)>>,
}

impl ScriptedWorker {
    pub fn new(
        script: impl Fn(&AnalysisRequest) -> Result<ChunkResult, DispatchError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::with_delay(Duration::from_millis(5), script)
    }

    pub fn with_delay(
        delay: Duration,
        script: impl Fn(&AnalysisRequest) -> Result<ChunkResult, DispatchError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            delay,
            running: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Answers every chunk with an empty completed result.
    pub fn succeeding() -> Arc<Self> {
        Self::new(|request| Ok(completed(&request.chunk_id, Vec::new())))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Concurrency observed when each call started.
    pub fn concurrency(&self) -> Vec<(String, usize)> {
        self.calls.lock().expect("calls").clone()
    }
}

#[async_trait]
impl AnalysisWorker for ScriptedWorker {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<ChunkResult, DispatchError> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls
            .lock()
            .expect("calls")
            .push((request.chunk_id.clone(), running));
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        (self.script)(request)
    }
}

pub fn completed(chunk_id: &str, findings: Vec<Finding>) -> ChunkResult {
    ChunkResult {
        chunk_id: chunk_id.to_string(),
        status: ResultStatus::Completed,
        findings,
        missing_info: Vec::new(),
        partial_answer: None,
    }
}

pub fn finding(point: &str, source: &str) -> Finding {
    Finding {
        point: point.to_string(),
        evidence: "quoted from the chunk".to_string(),
        confidence: Confidence::High,
        source: SourceLocation::parse(source),
    }
}

/// `chunk_00012` -> 12
pub fn chunk_number(chunk_id: &str) -> usize {
    chunk_id
        .trim_start_matches("chunk_")
        .parse()
        .expect("numbered chunk id")
}

pub fn workers(standard: Arc<ScriptedWorker>) -> Workers {
    Workers {
        standard,
        escalated: None,
    }
}

/// Small windows and fast retries so a tiny project yields many batches.
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.chunking.size = 64;
    config.chunking.overlap = 0;
    config.chunking.align_to_lines = false;
    config.chunk_timeout_ms = 10_000;
    config.retry = RetryPolicy {
        attempts: 1,
        initial_backoff_ms: 1,
        max_backoff_ms: 1,
    };
    config.sandbox.isolation = IsolationMode::InProcess;
    config.sandbox.require_resource_limits = false;
    config
}

pub fn write_file(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(path, contents).expect("write file");
}

pub struct Harness {
    pub project: TempDir,
    pub state: TempDir,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(config: OrchestratorConfig) -> Self {
        let project = TempDir::new().expect("project dir");
        let state = TempDir::new().expect("state dir");
        let orchestrator = Orchestrator::new(config, state.path()).expect("orchestrator");
        Self {
            project,
            state,
            orchestrator,
        }
    }

    /// A project of one ~1 KiB text file: sixteen 64-byte chunks.
    pub fn with_large_file(config: OrchestratorConfig) -> Self {
        let harness = Self::new(config);
        let line = "the quick brown fox jumps over the lazy dog again\n";
        write_file(harness.project.path(), "notes.txt", &line.repeat(20));
        harness
    }

    pub async fn init(&self, query: &str) -> String {
        self.orchestrator
            .init(InitOptions {
                root: self.project.path().to_path_buf(),
                query: query.to_string(),
                ..InitOptions::default()
            })
            .await
            .expect("init")
            .session_id
    }

    pub async fn init_and_chunk(&self) -> (String, usize) {
        let id = self.init("what does the fox do?").await;
        let summary = self.orchestrator.chunk(Some(&id)).await.expect("chunk");
        (id, summary.chunks)
    }
}
