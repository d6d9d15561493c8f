use chunkwise_chunker::ChunkingStrategy;
use chunkwise_orchestrator::config::split_command;
use chunkwise_orchestrator::{ExportFormat, OrchestratorConfig};
use chunkwise_sandbox::IsolationMode;
use clap::{Args, ValueEnum};

#[derive(Copy, Clone, ValueEnum)]
pub(crate) enum StrategyFlag {
    Fixed,
    Structure,
}

impl StrategyFlag {
    pub(crate) const fn as_domain(self) -> ChunkingStrategy {
        match self {
            StrategyFlag::Fixed => ChunkingStrategy::Fixed,
            StrategyFlag::Structure => ChunkingStrategy::Structure,
        }
    }
}

#[derive(Copy, Clone, ValueEnum)]
pub(crate) enum IsolationFlag {
    Process,
    InProcess,
}

impl IsolationFlag {
    pub(crate) const fn as_domain(self) -> IsolationMode {
        match self {
            IsolationFlag::Process => IsolationMode::Process,
            IsolationFlag::InProcess => IsolationMode::InProcess,
        }
    }
}

#[derive(Copy, Clone, ValueEnum)]
pub(crate) enum ExportFormatFlag {
    Json,
    Markdown,
}

impl ExportFormatFlag {
    pub(crate) const fn as_domain(self) -> ExportFormat {
        match self {
            ExportFormatFlag::Json => ExportFormat::Json,
            ExportFormatFlag::Markdown => ExportFormat::Markdown,
        }
    }
}

#[derive(Copy, Clone, ValueEnum)]
pub(crate) enum SchemaDocument {
    /// Session state (`state.json`)
    State,
    /// Mapping checkpoint (`checkpoint.json`)
    Checkpoint,
    /// One line of `progress.jsonl`
    Progress,
    /// What an analysis worker receives
    Request,
    /// What an analysis worker returns
    Result,
    /// Reduced session report
    Report,
    /// Incremental delta against a base session
    Delta,
    /// `--json` error envelope
    Error,
}

/// Highest-precedence configuration layer. Every flag is optional; unset
/// flags leave `chunkwise.toml` and `CHUNKWISE_*` values alone.
#[derive(Args, Default)]
pub(crate) struct ConfigOverrides {
    /// Chunks per checkpointed batch
    #[arg(long, global = true)]
    batch_width: Option<usize>,

    /// Concurrent analysis calls within a batch
    #[arg(long, global = true)]
    max_parallel: Option<usize>,

    /// Wall-clock limit for one analysis call
    #[arg(long, global = true)]
    chunk_timeout_ms: Option<u64>,

    /// Attempts per chunk for transient failures
    #[arg(long, global = true)]
    retry_attempts: Option<u32>,

    /// How long a graceful interrupt may take before work is dropped
    #[arg(long, global = true)]
    grace_period_ms: Option<u64>,

    /// Target chunk size in bytes
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    /// Maximum overlap between adjacent chunks in bytes
    #[arg(long, global = true)]
    chunk_overlap: Option<usize>,

    /// Chunk boundary strategy
    #[arg(long, global = true, value_enum)]
    strategy: Option<StrategyFlag>,

    /// Where sandboxed programs run
    #[arg(long, global = true, value_enum)]
    isolation: Option<IsolationFlag>,

    /// Run the sandbox even where memory and CPU limits cannot be applied
    #[arg(long, global = true)]
    no_resource_limits: bool,

    /// Analysis worker command line (JSON request on stdin, result on stdout)
    #[arg(long, global = true)]
    worker_cmd: Option<String>,

    /// Worker command line for escalated chunks
    #[arg(long, global = true)]
    escalation_cmd: Option<String>,
}

impl ConfigOverrides {
    pub(crate) fn apply(&self, config: &mut OrchestratorConfig) {
        if let Some(value) = self.batch_width {
            config.batch_width = value;
        }
        if let Some(value) = self.max_parallel {
            config.max_parallel = value;
        }
        if let Some(value) = self.chunk_timeout_ms {
            config.chunk_timeout_ms = value;
        }
        if let Some(value) = self.retry_attempts {
            config.retry.attempts = value;
        }
        if let Some(value) = self.grace_period_ms {
            config.grace_period_ms = value;
        }
        if let Some(value) = self.chunk_size {
            config.chunking.size = value;
        }
        if let Some(value) = self.chunk_overlap {
            config.chunking.overlap = value;
        }
        if let Some(value) = self.strategy {
            config.chunking.strategy = value.as_domain();
        }
        if let Some(value) = self.isolation {
            config.sandbox.isolation = value.as_domain();
        }
        if self.no_resource_limits {
            config.sandbox.require_resource_limits = false;
        }
        if let Some(raw) = &self.worker_cmd {
            config.worker.command = split_command(raw);
        }
        if let Some(raw) = &self.escalation_cmd {
            config.worker.escalation_command = split_command(raw);
        }
    }
}
