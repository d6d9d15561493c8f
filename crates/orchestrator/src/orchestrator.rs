use crate::cancel::{CancelMode, CancellationManager};
use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::OrchestratorConfig;
use crate::context;
use crate::dispatch::{
    escalation_allowance, is_failing_batch, plan_batches, run_batch, BatchRun, ChunkOutcome,
    DispatchSettings,
};
use crate::error::{OrchestratorError, Result};
use crate::phase::{check_advance, Phase};
use crate::progress::{ProgressEvent, ProgressKind};
use crate::state::{ChunkRecord, ChunkStatus, ChunkingRecord, EscalationLedger, SessionState};
use crate::store::{
    new_session_id, read_json, validate_session_id, write_bytes_atomic, write_json_atomic, CleanReport,
    SessionStore, SessionSummary,
};
use crate::worker::{AnalysisRequest, AnalysisWorker, WorkerTier};
use chunkwise_aggregator::{AggregateInput, AggregateReport, Aggregator};
use chunkwise_chunker::{chunk_timeout_for, producer_for, ChunkingStrategy};
use chunkwise_protocol::path_filters::PathFilter;
use chunkwise_protocol::{unix_now_ms, ChunkResult, DeltaReport};
use chunkwise_sandbox::{
    EvalOutcome, Sandbox, Scope, SearchOptions, SearchOutcome, SearchRange, WorkerCommand,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// What `init` should load.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub root: PathBuf,
    pub query: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub pattern: Option<String>,
    /// Base session for an incremental run
    pub incremental_from: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitSummary {
    pub session_id: String,
    pub files: usize,
    pub skipped_files: usize,
    pub context_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<DeltaReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub session_id: String,
    pub chunks: usize,
    pub strategy: String,
    pub size: usize,
    pub overlap: usize,
    /// Chunks already existed; nothing was recomputed
    pub reused: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MapOptions {
    /// Retry quality failures once on the escalation tier, within budget
    pub escalate: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapSummary {
    pub session_id: String,
    pub batches: usize,
    pub completed: usize,
    pub failed: usize,
    pub escalated: usize,
    pub sequential_fallback: bool,
    /// Chunks still without an outcome in the session
    pub remaining: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub session_id: String,
    pub query: String,
    pub root: PathBuf,
    pub phase: Phase,
    pub aborted: bool,
    pub current: bool,
    pub files: usize,
    pub skipped_files: usize,
    pub context_bytes: usize,
    pub chunks: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub sequential_fallback: bool,
    pub escalation: EscalationLedger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_batch: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Markdown,
}

/// Analysis workers used by `map`.
#[derive(Clone)]
pub struct Workers {
    pub standard: Arc<dyn AnalysisWorker>,
    pub escalated: Option<Arc<dyn AnalysisWorker>>,
}

/// Drives sessions through
/// `initialized -> scouting -> chunking -> mapping -> reducing -> completed`.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: SessionStore,
    sandbox_worker: Option<WorkerCommand>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, state_dir: impl Into<PathBuf>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store: SessionStore::new(state_dir),
            sandbox_worker: None,
        })
    }

    /// Executable used for process-isolated evaluation and search.
    pub fn with_sandbox_worker(mut self, worker: WorkerCommand) -> Self {
        self.sandbox_worker = Some(worker);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// An explicit id, or the current-session marker.
    pub async fn resolve(&self, id: Option<&str>) -> Result<String> {
        match id {
            Some(id) => {
                validate_session_id(id)?;
                Ok(id.to_string())
            }
            None => self
                .store
                .current()
                .await?
                .ok_or(OrchestratorError::NoCurrentSession),
        }
    }

    // ---------------------------------------------------------------------
    // init
    // ---------------------------------------------------------------------

    pub async fn init(&self, options: InitOptions) -> Result<InitSummary> {
        let query = options.query.trim().to_string();
        if query.is_empty() {
            return Err(OrchestratorError::InvalidInput("query must not be empty".into()));
        }
        if !options.root.exists() {
            return Err(OrchestratorError::InvalidInput(format!(
                "{} does not exist",
                options.root.display()
            )));
        }
        let root = std::fs::canonicalize(&options.root)
            .map_err(|e| OrchestratorError::io(&options.root, e))?;

        let base = match options.incremental_from.as_deref() {
            Some(base_id) => {
                let base = self.resolve_existing(base_id).await?;
                if base.root != root {
                    log::warn!(
                        "base session {} analyzed {}, this run analyzes {}",
                        base.id,
                        base.root.display(),
                        root.display()
                    );
                }
                Some((base.id, base.manifest))
            }
            None => None,
        };

        let filter = PathFilter::new(&options.include, &options.exclude, options.pattern.as_deref());
        let limits = self.config.context.clone();
        let scan_root = root.clone();
        let (loaded, delta) = tokio::task::spawn_blocking(move || {
            let base = base.as_ref().map(|(id, manifest)| (id.as_str(), manifest.as_slice()));
            context::load(&scan_root, &filter, &limits, base)
        })
        .await
        .map_err(|e| OrchestratorError::Internal(format!("context loader: {e}")))??;

        // An incremental run may consist of deletions only.
        if loaded.manifest.is_empty() && delta.as_ref().map_or(true, |d| d.deleted.is_empty()) {
            return Err(OrchestratorError::EmptyContext(root));
        }

        let id = new_session_id()?;
        let paths = self.store.create(&id).await?;
        write_bytes_atomic(&paths.context(), loaded.text.as_bytes()).await?;

        let mut state = SessionState::new(id.clone(), query.clone(), root, unix_now_ms());
        state.context_bytes = loaded.text.len();
        state.manifest = loaded.manifest;
        state.skipped_files = loaded.skipped;
        state.base_session = delta.as_ref().map(|d| d.base_session.clone());
        state.delta = delta.clone();
        self.store.save_state(&mut state).await?;
        self.store.set_current(&id).await?;
        self.emit(
            &id,
            ProgressKind::SessionCreated {
                query,
                files: state.manifest.len(),
                context_bytes: state.context_bytes,
                base_session: state.base_session.clone(),
            },
        )
        .await?;

        log::info!(
            "session {id}: {} files, {} bytes of context",
            state.manifest.len(),
            state.context_bytes
        );
        Ok(InitSummary {
            session_id: id,
            files: state.manifest.len(),
            skipped_files: state.skipped_files,
            context_bytes: state.context_bytes,
            delta,
        })
    }

    // ---------------------------------------------------------------------
    // explore
    // ---------------------------------------------------------------------

    /// Evaluate an exploration program against the session context.
    /// Sandbox rejections are returned to the caller and leave the session
    /// untouched apart from entering scouting.
    pub async fn eval(&self, id: Option<&str>, source: &str) -> Result<EvalOutcome> {
        let (sandbox, scope) = self.explore_scope(id).await?;
        Ok(sandbox.evaluate(source, &scope).await?)
    }

    pub async fn search(
        &self,
        id: Option<&str>,
        pattern: &str,
        range: Option<SearchRange>,
        options: &SearchOptions,
    ) -> Result<SearchOutcome> {
        let (sandbox, scope) = self.explore_scope(id).await?;
        Ok(sandbox.search(pattern, &scope, range, options).await?)
    }

    async fn explore_scope(&self, id: Option<&str>) -> Result<(Sandbox, Scope)> {
        let id = self.resolve(id).await?;
        let mut state = self.store.load_state(&id).await?;
        ensure_active(&state)?;
        if state.phase < Phase::Scouting {
            let _lock = self.store.lock(&id)?;
            state = self.store.load_state(&id).await?;
            if state.phase < Phase::Scouting {
                self.advance(&mut state, Phase::Scouting).await?;
            }
        }
        let sandbox = Sandbox::new(self.config.sandbox.clone(), self.sandbox_worker.clone())?;
        let (size, overlap) = state
            .chunking
            .as_ref()
            .map_or((self.config.chunking.size, self.config.chunking.overlap), |c| (c.size, c.overlap));
        let scope = Scope::file(self.store.paths(&id)?.context()).with_chunking(size, overlap);
        Ok((sandbox, scope))
    }

    // ---------------------------------------------------------------------
    // chunk
    // ---------------------------------------------------------------------

    /// Produce the session's chunks. Chunks are produced once; later calls
    /// report the existing ones.
    pub async fn chunk(&self, id: Option<&str>) -> Result<ChunkSummary> {
        let id = self.resolve(id).await?;
        let _lock = self.store.lock(&id)?;
        let mut state = self.store.load_state(&id).await?;
        ensure_active(&state)?;

        if let Some(record) = &state.chunking {
            return Ok(ChunkSummary {
                session_id: id,
                chunks: state.chunks.len(),
                strategy: record.strategy.clone(),
                size: record.size,
                overlap: record.overlap,
                reused: true,
            });
        }
        check_advance(&id, state.phase, Phase::Chunking, "chunk")?;

        let text = self.read_context(&state).await?;
        let config = self.config.chunking.clone();
        let producer = producer_for(&config)?;
        let (text, spans) = if text.is_empty() {
            (text, Vec::new())
        } else {
            let deadline = Instant::now() + chunk_timeout_for(text.len());
            tokio::task::spawn_blocking(move || {
                let spans = producer.spans(&text, Some(deadline));
                spans.map(|spans| (text, spans))
            })
            .await
            .map_err(|e| OrchestratorError::Internal(format!("chunk producer: {e}")))??
        };

        let paths = self.store.paths(&id)?;
        for span in &spans {
            let path = paths.chunk(&span.id());
            tokio::fs::write(&path, span.slice(&text))
                .await
                .map_err(|e| OrchestratorError::io(&path, e))?;
        }

        state.chunks = spans
            .iter()
            .map(|span| ChunkRecord {
                id: span.id(),
                index: span.index,
                start: span.start,
                end: span.end,
                status: ChunkStatus::Pending,
                attempts: 0,
                escalated: false,
                last_error: None,
            })
            .collect();
        let strategy = match config.strategy {
            ChunkingStrategy::Fixed => "fixed",
            ChunkingStrategy::Structure => "structure",
        };
        state.chunking = Some(ChunkingRecord {
            strategy: strategy.to_string(),
            size: config.size,
            overlap: config.overlap,
        });
        self.advance(&mut state, Phase::Chunking).await?;

        log::info!("session {id}: {} chunks ({strategy})", state.chunks.len());
        Ok(ChunkSummary {
            session_id: id,
            chunks: state.chunks.len(),
            strategy: strategy.to_string(),
            size: config.size,
            overlap: config.overlap,
            reused: false,
        })
    }

    // ---------------------------------------------------------------------
    // map
    // ---------------------------------------------------------------------

    /// Dispatch every pending chunk in checkpointed batches.
    ///
    /// Cancellation is checked between batches. A graceful request lets the
    /// running batch finish and be checkpointed; a forced request, or a
    /// graceful one that outlives the grace period, drops in-flight work
    /// without writing anything further. Both end in
    /// [`OrchestratorError::Cancelled`].
    pub async fn map(
        &self,
        id: Option<&str>,
        options: MapOptions,
        workers: &Workers,
        cancel: &CancellationManager,
    ) -> Result<MapSummary> {
        let id = self.resolve(id).await?;
        let _lock = self.store.lock(&id)?;
        let mut state = self.store.load_state(&id).await?;
        ensure_active(&state)?;
        if state.chunking.is_none() || state.phase > Phase::Mapping {
            return Err(invalid_phase(&state, "map"));
        }
        if options.escalate && workers.escalated.is_none() {
            return Err(OrchestratorError::WorkerUnavailable(
                "escalation was requested but no escalation worker is configured".into(),
            ));
        }

        let checkpoints = CheckpointManager::new(self.store.paths(&id)?.checkpoint());
        let mut batch_index = checkpoints.next_batch_index(&state).await?;
        self.reconcile(&mut state).await?;
        self.advance(&mut state, Phase::Mapping).await?;

        let context = self.read_context(&state).await?;
        let pending: Vec<String> = state
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Pending)
            .map(|c| c.id.clone())
            .collect();
        let mut summary = MapSummary {
            session_id: id.clone(),
            ..MapSummary::default()
        };
        log::info!(
            "session {id}: mapping {} pending chunks in batches of {}",
            pending.len(),
            self.config.batch_width
        );

        for batch in plan_batches(&pending, self.config.batch_width) {
            if cancel.is_requested() {
                return Err(self.stop_between_batches(&id, cancel.mode(), summary.batches).await);
            }

            for chunk_id in &batch {
                if let Some(chunk) = state.chunk_mut(chunk_id) {
                    chunk.status = ChunkStatus::Processing;
                }
            }
            self.store.save_state(&mut state).await?;
            self.emit(
                &id,
                ProgressKind::BatchStarted {
                    batch_index,
                    chunk_ids: batch.clone(),
                    sequential: state.sequential_fallback,
                },
            )
            .await?;

            let settings = self.dispatch_settings(state.sequential_fallback);
            let requests = batch
                .iter()
                .map(|chunk_id| self.request(&state, &context, chunk_id, WorkerTier::Standard))
                .collect::<Result<Vec<_>>>()?;
            let BatchRun::Finished(mut outcomes) =
                run_batch(Arc::clone(&workers.standard), requests, &settings, cancel).await
            else {
                return Err(abandoned(cancel, summary.batches));
            };

            if options.escalate {
                if let Some(escalated) = &workers.escalated {
                    summary.escalated += self
                        .escalate(&mut state, &context, &mut outcomes, escalated, &settings, cancel)
                        .await?;
                }
            }

            let failed = self.record_outcomes(&mut state, outcomes, &mut summary).await?;
            if is_failing_batch(failed, batch.len(), self.config.failure_rate_threshold) {
                state.consecutive_failing_batches += 1;
            } else {
                state.consecutive_failing_batches = 0;
            }
            if !state.sequential_fallback
                && state.consecutive_failing_batches >= self.config.fallback_after_batches
            {
                state.sequential_fallback = true;
                log::warn!(
                    "session {id}: {} consecutive failing batches, switching to sequential dispatch",
                    state.consecutive_failing_batches
                );
                self.emit(
                    &id,
                    ProgressKind::FallbackSequential {
                        batch_index,
                        consecutive_failing_batches: state.consecutive_failing_batches,
                    },
                )
                .await?;
            }

            self.store.save_state(&mut state).await?;
            let snapshot = Checkpoint::capture(&state, batch_index);
            checkpoints.write(&snapshot).await?;
            self.emit(
                &id,
                ProgressKind::CheckpointWritten {
                    batch_index,
                    completed: snapshot.completed.len(),
                },
            )
            .await?;
            summary.batches += 1;
            batch_index += 1;
        }

        if cancel.is_requested() && state.chunks.iter().any(|c| !c.status.is_terminal()) {
            return Err(self.stop_between_batches(&id, cancel.mode(), summary.batches).await);
        }

        summary.sequential_fallback = state.sequential_fallback;
        summary.remaining = state.chunks.iter().filter(|c| !c.status.is_terminal()).count();
        log::info!(
            "session {id}: {} batches, {} completed, {} failed, {} escalated",
            summary.batches,
            summary.completed,
            summary.failed,
            summary.escalated
        );
        Ok(summary)
    }

    /// Re-enter mapping from the last checkpoint. Completed chunks are kept;
    /// failed and interrupted chunks are dispatched again.
    pub async fn resume(
        &self,
        id: Option<&str>,
        options: MapOptions,
        workers: &Workers,
        cancel: &CancellationManager,
    ) -> Result<MapSummary> {
        let id = self.resolve(id).await?;
        {
            let _lock = self.store.lock(&id)?;
            let mut state = self.store.load_state(&id).await?;
            ensure_active(&state)?;
            if !state.phase.can_resume() {
                return Err(invalid_phase(&state, "resume"));
            }
            let checkpoint = CheckpointManager::new(self.store.paths(&id)?.checkpoint())
                .load(&state)
                .await?;
            let done = checkpoint.map(|c| c.completed).unwrap_or_default();
            let mut requeued = 0usize;
            for chunk in &mut state.chunks {
                if done.contains(&chunk.id) {
                    chunk.status = ChunkStatus::Completed;
                } else if chunk.status == ChunkStatus::Failed {
                    chunk.status = ChunkStatus::Pending;
                    requeued += 1;
                }
            }
            if state.phase == Phase::Reducing {
                // The one backward transition.
                state.phase = Phase::Mapping;
                self.emit(
                    &id,
                    ProgressKind::PhaseChanged {
                        from: Phase::Reducing,
                        to: Phase::Mapping,
                    },
                )
                .await?;
            }
            state.consecutive_failing_batches = 0;
            self.store.save_state(&mut state).await?;
            log::info!("session {id}: resuming with {requeued} failed chunks requeued");
        }
        self.map(Some(&id), options, workers, cancel).await
    }

    // ---------------------------------------------------------------------
    // reduce / export
    // ---------------------------------------------------------------------

    pub async fn reduce(&self, id: Option<&str>) -> Result<AggregateReport> {
        let id = self.resolve(id).await?;
        let _lock = self.store.lock(&id)?;
        let mut state = self.store.load_state(&id).await?;
        ensure_active(&state)?;
        let paths = self.store.paths(&id)?;

        if state.phase == Phase::Completed {
            if let Some(report) = read_json::<AggregateReport>(&paths.report()).await? {
                return Ok(report);
            }
        }
        let unmapped = state.chunks.iter().any(|c| !c.status.is_terminal());
        if state.phase < Phase::Mapping || unmapped {
            return Err(invalid_phase(&state, "reduce before every chunk has been mapped"));
        }
        self.advance(&mut state, Phase::Reducing).await?;

        let results = self.store.read_results(&state).await?;
        let base_results = match state.base_session.as_deref() {
            Some(base_id) => {
                let base = self.resolve_existing(base_id).await?;
                self.store.read_results(&base).await?
            }
            None => Vec::new(),
        };
        let aggregator = Aggregator::new(self.config.aggregate.clone())?;
        let report = aggregator.aggregate(AggregateInput {
            session_id: &state.id,
            query: &state.query,
            results: &results,
            base_results: &base_results,
            delta: state.delta.as_ref(),
        });
        write_json_atomic(&paths.report(), &report).await?;

        self.advance(&mut state, Phase::Completed).await?;
        self.emit(
            &id,
            ProgressKind::SessionCompleted {
                findings: report.findings.len(),
                contradictions: report.contradictions.len(),
            },
        )
        .await?;
        Ok(report)
    }

    pub async fn export(&self, id: Option<&str>, format: ExportFormat) -> Result<String> {
        let id = self.resolve(id).await?;
        let state = self.store.load_state(&id).await?;
        let path = self.store.paths(&id)?.report();
        let Some(report) = read_json::<AggregateReport>(&path).await? else {
            return Err(invalid_phase(&state, "export before reduce"));
        };
        match format {
            ExportFormat::Json => Ok(report.to_json_pretty()?),
            ExportFormat::Markdown => Ok(report.to_markdown()),
        }
    }

    // ---------------------------------------------------------------------
    // sessions
    // ---------------------------------------------------------------------

    pub async fn status(&self, id: Option<&str>) -> Result<StatusReport> {
        let id = self.resolve(id).await?;
        let state = self.store.load_state(&id).await?;
        let checkpoint = CheckpointManager::new(self.store.paths(&id)?.checkpoint())
            .load(&state)
            .await?;
        let current = self.store.current().await?.as_deref() == Some(id.as_str());
        Ok(StatusReport {
            session_id: state.id.clone(),
            query: state.query.clone(),
            root: state.root.clone(),
            phase: state.phase,
            aborted: state.aborted,
            current,
            files: state.manifest.len(),
            skipped_files: state.skipped_files,
            context_bytes: state.context_bytes,
            chunks: state.chunks.len(),
            pending: state.count(ChunkStatus::Pending),
            processing: state.count(ChunkStatus::Processing),
            completed: state.count(ChunkStatus::Completed),
            failed: state.count(ChunkStatus::Failed),
            sequential_fallback: state.sequential_fallback,
            escalation: state.escalation.clone(),
            last_checkpoint_batch: checkpoint.map(|c| c.batch_index),
            base_session: state.base_session.clone(),
            delta: state.delta.as_ref().map(DeltaReport::summary),
        })
    }

    /// Mark a session aborted. Its data stays for inspection.
    pub async fn abort(&self, id: Option<&str>) -> Result<()> {
        let id = self.resolve(id).await?;
        let _lock = self.store.lock(&id)?;
        let mut state = self.store.load_state(&id).await?;
        if state.phase == Phase::Completed {
            return Err(invalid_phase(&state, "abort"));
        }
        state.aborted = true;
        self.store.save_state(&mut state).await?;
        log::info!("session {id} aborted");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        self.store.list().await
    }

    pub async fn use_session(&self, id: &str) -> Result<()> {
        self.resolve_existing(id).await?;
        self.store.set_current(id).await
    }

    /// Remove one session, or apply the age and size caps to all of them.
    pub async fn clean(&self, id: Option<&str>) -> Result<CleanReport> {
        match id {
            Some(id) => {
                let freed_bytes = self.store.delete(id).await?;
                Ok(CleanReport {
                    removed: vec![id.to_string()],
                    freed_bytes,
                    skipped_locked: Vec::new(),
                })
            }
            None => self.store.gc(&self.config.gc, unix_now_ms()).await,
        }
    }

    // ---------------------------------------------------------------------
    // internals
    // ---------------------------------------------------------------------

    async fn resolve_existing(&self, id: &str) -> Result<SessionState> {
        validate_session_id(id)?;
        self.store.load_state(id).await
    }

    /// Move forward to `next` (or stay), persist, and log the change.
    async fn advance(&self, state: &mut SessionState, next: Phase) -> Result<()> {
        check_advance(&state.id, state.phase, next, next.as_str())?;
        let from = state.phase;
        state.phase = next;
        self.store.save_state(state).await?;
        if from != next {
            log::info!("session {}: {from} -> {next}", state.id);
            self.emit(&state.id, ProgressKind::PhaseChanged { from, to: next })
                .await?;
        }
        Ok(())
    }

    async fn emit(&self, id: &str, kind: ProgressKind) -> Result<()> {
        self.store.append_progress(id, &ProgressEvent::now(kind)).await
    }

    async fn read_context(&self, state: &SessionState) -> Result<String> {
        let path = self.store.paths(&state.id)?.context();
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| OrchestratorError::io(&path, e))?;
        if text.len() != state.context_bytes {
            return Err(OrchestratorError::corrupt(
                &path,
                format!(
                    "context is {} bytes, state records {}",
                    text.len(),
                    state.context_bytes
                ),
            ));
        }
        Ok(text)
    }

    /// Chunks left `processing` by an interrupted run go back to pending,
    /// unless their result already landed.
    async fn reconcile(&self, state: &mut SessionState) -> Result<()> {
        let id = state.id.clone();
        for chunk in state.chunks.iter_mut().filter(|c| c.status == ChunkStatus::Processing) {
            let recorded = self.store.read_result(&id, &chunk.id).await?;
            chunk.status = match recorded {
                Some(result) if result.chunk_id == chunk.id && result.status.is_usable() => {
                    ChunkStatus::Completed
                }
                _ => ChunkStatus::Pending,
            };
            log::debug!("{} was interrupted; now {:?}", chunk.id, chunk.status);
        }
        Ok(())
    }

    fn dispatch_settings(&self, sequential: bool) -> DispatchSettings {
        DispatchSettings {
            timeout: self.config.chunk_timeout(),
            retry: self.config.retry.clone(),
            parallel: if sequential { 1 } else { self.config.max_parallel },
        }
    }

    fn request(
        &self,
        state: &SessionState,
        context: &str,
        chunk_id: &str,
        tier: WorkerTier,
    ) -> Result<AnalysisRequest> {
        let path = self.store.paths(&state.id)?.context();
        let chunk = state
            .chunk(chunk_id)
            .ok_or_else(|| OrchestratorError::corrupt(&path, format!("unknown chunk {chunk_id}")))?;
        let text = context.get(chunk.start..chunk.end).ok_or_else(|| {
            OrchestratorError::corrupt(&path, format!("{chunk_id} does not fall on character boundaries"))
        })?;
        Ok(AnalysisRequest {
            session_id: state.id.clone(),
            chunk_id: chunk_id.to_string(),
            query: state.query.clone(),
            text: text.to_string(),
            tier,
            attempt: 0,
        })
    }

    /// Retry quality failures once on the escalation tier while the budget
    /// lasts. Returns how many chunks were escalated.
    async fn escalate(
        &self,
        state: &mut SessionState,
        context: &str,
        outcomes: &mut [ChunkOutcome],
        worker: &Arc<dyn AnalysisWorker>,
        settings: &DispatchSettings,
        cancel: &CancellationManager,
    ) -> Result<usize> {
        let candidates: Vec<usize> = outcomes
            .iter()
            .enumerate()
            .filter(|(_, outcome)| {
                matches!(&outcome.result, Err(err) if err.is_escalatable())
                    && state.chunk(&outcome.chunk_id).is_some_and(|c| !c.escalated)
            })
            .map(|(position, _)| position)
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }
        let allowance = escalation_allowance(&self.config.escalation, state.chunks.len(), &state.escalation);
        if allowance < candidates.len() {
            log::info!(
                "escalation budget allows {allowance} of {} quality failures",
                candidates.len()
            );
        }
        let chosen: Vec<usize> = candidates.into_iter().take(allowance).collect();
        if chosen.is_empty() {
            return Ok(0);
        }

        let mut requests = Vec::with_capacity(chosen.len());
        for &position in &chosen {
            let chunk_id = outcomes[position].chunk_id.clone();
            requests.push(self.request(state, context, &chunk_id, WorkerTier::Escalated)?);
            if let Some(chunk) = state.chunk_mut(&chunk_id) {
                chunk.escalated = true;
            }
            state.escalation.escalated += 1;
            state.escalation.cost_spent += self.config.escalation.cost_per_chunk;
        }

        let BatchRun::Finished(retried) = run_batch(Arc::clone(worker), requests, settings, cancel).await else {
            return Err(abandoned(cancel, 0));
        };
        let mut retried: HashMap<String, ChunkOutcome> =
            retried.into_iter().map(|o| (o.chunk_id.clone(), o)).collect();
        for &position in &chosen {
            let original = &mut outcomes[position];
            let Some(second) = retried.remove(&original.chunk_id) else {
                continue;
            };
            let succeeded = second.result.is_ok();
            original.attempts += second.attempts;
            if succeeded {
                original.result = second.result;
            }
            self.emit(
                &state.id,
                ProgressKind::ChunkEscalated {
                    chunk_id: original.chunk_id.clone(),
                    succeeded,
                    cost_spent: state.escalation.cost_spent,
                },
            )
            .await?;
        }
        Ok(chosen.len())
    }

    /// Persist each outcome as the chunk's result. Returns the failure count.
    async fn record_outcomes(
        &self,
        state: &mut SessionState,
        outcomes: Vec<ChunkOutcome>,
        summary: &mut MapSummary,
    ) -> Result<usize> {
        let id = state.id.clone();
        let mut failed = 0usize;
        for outcome in outcomes {
            let (status, kind) = match outcome.result {
                Ok(result) => {
                    self.store.write_result(&id, &result).await?;
                    summary.completed += 1;
                    (
                        ChunkStatus::Completed,
                        ProgressKind::ChunkCompleted {
                            chunk_id: outcome.chunk_id.clone(),
                            attempts: outcome.attempts,
                            findings: result.findings.len(),
                        },
                    )
                }
                Err(err) => {
                    let reason = err.to_string();
                    log::warn!("{} failed after {} attempts: {reason}", outcome.chunk_id, outcome.attempts);
                    self.store
                        .write_result(&id, &ChunkResult::failed(&outcome.chunk_id, &reason))
                        .await?;
                    failed += 1;
                    summary.failed += 1;
                    (
                        ChunkStatus::Failed,
                        ProgressKind::ChunkFailed {
                            chunk_id: outcome.chunk_id.clone(),
                            attempts: outcome.attempts,
                            reason,
                        },
                    )
                }
            };
            if let Some(chunk) = state.chunk_mut(&outcome.chunk_id) {
                chunk.attempts += outcome.attempts;
                chunk.last_error = match &kind {
                    ProgressKind::ChunkFailed { reason, .. } => Some(reason.clone()),
                    _ => None,
                };
                chunk.status = status;
            }
            self.emit(&id, kind).await?;
        }
        Ok(failed)
    }

    async fn stop_between_batches(&self, id: &str, mode: CancelMode, checkpointed: usize) -> OrchestratorError {
        if mode == CancelMode::Graceful {
            if let Err(err) = self
                .emit(
                    id,
                    ProgressKind::CancelRequested {
                        mode: mode.as_str().to_string(),
                    },
                )
                .await
            {
                log::warn!("could not record cancellation: {err}");
            }
        }
        log::warn!("session {id}: stopped after {checkpointed} batches ({})", mode.as_str());
        OrchestratorError::Cancelled {
            mode: mode.as_str().to_string(),
            checkpointed,
        }
    }
}

fn ensure_active(state: &SessionState) -> Result<()> {
    if state.aborted {
        return Err(OrchestratorError::Aborted(state.id.clone()));
    }
    Ok(())
}

fn invalid_phase(state: &SessionState, operation: &str) -> OrchestratorError {
    OrchestratorError::InvalidPhase {
        id: state.id.clone(),
        phase: state.phase,
        operation: operation.to_string(),
    }
}

fn abandoned(cancel: &CancellationManager, checkpointed: usize) -> OrchestratorError {
    let mode = match cancel.mode() {
        CancelMode::Forced => "forced",
        _ => "grace period expired",
    };
    OrchestratorError::Cancelled {
        mode: mode.to_string(),
        checkpointed,
    }
}

