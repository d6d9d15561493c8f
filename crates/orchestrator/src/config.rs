//! Orchestrator settings, layered: built-in defaults, then
//! `<state_dir>/chunkwise.toml`, then `CHUNKWISE_*` environment variables.
//! Command-line flags are applied last by the caller, which then calls
//! [`OrchestratorConfig::validate`].

use crate::error::{OrchestratorError, Result};
use crate::retry::RetryPolicy;
use chunkwise_aggregator::AggregatorConfig;
use chunkwise_chunker::{ChunkerConfig, ChunkingStrategy};
use chunkwise_sandbox::{IsolationMode, SandboxConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "chunkwise.toml";
pub const ENV_PREFIX: &str = "CHUNKWISE_";

/// Budget for retrying quality failures on the more capable worker tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// At most this fraction of the session's chunks may be escalated
    pub max_fraction: f64,
    /// Total cost ceiling across the session
    pub max_cost: f64,
    /// Cost charged per escalated chunk
    pub cost_per_chunk: f64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_fraction: 0.2,
            max_cost: 10.0,
            cost_per_chunk: 1.0,
        }
    }
}

/// External command implementing the analysis worker contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Program and arguments for the standard tier
    pub command: Vec<String>,
    /// Program and arguments for the escalated tier
    pub escalation_command: Vec<String>,
}

/// Limits on what `init` loads into a session context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextLimits {
    pub max_file_bytes: u64,
    pub max_context_bytes: u64,
    /// Follow `.gitignore`, `.ignore` and git excludes
    pub respect_gitignore: bool,
    pub include_hidden: bool,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 1024 * 1024,
            max_context_bytes: 256 * 1024 * 1024,
            respect_gitignore: true,
            include_hidden: false,
        }
    }
}

/// Caps applied by `sessions clean`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcPolicy {
    pub max_age_days: u64,
    pub max_total_bytes: u64,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            max_total_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Chunks per batch; a checkpoint is written after every batch
    pub batch_width: usize,
    /// Concurrent dispatches within a batch
    pub max_parallel: usize,
    /// Wall-clock limit for one analysis call
    pub chunk_timeout_ms: u64,
    pub retry: RetryPolicy,
    /// A batch is failing when more than this fraction of it failed
    pub failure_rate_threshold: f64,
    /// Consecutive failing batches before falling back to sequential dispatch
    pub fallback_after_batches: u32,
    pub escalation: EscalationConfig,
    /// How long a graceful cancellation may take before it is abandoned
    pub grace_period_ms: u64,
    pub chunking: ChunkerConfig,
    pub sandbox: SandboxConfig,
    pub aggregate: AggregatorConfig,
    pub context: ContextLimits,
    pub gc: GcPolicy,
    pub worker: WorkerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_width: 5,
            max_parallel: 4,
            chunk_timeout_ms: 300_000,
            retry: RetryPolicy::default(),
            failure_rate_threshold: 0.5,
            fallback_after_batches: 2,
            escalation: EscalationConfig::default(),
            grace_period_ms: 30_000,
            chunking: ChunkerConfig::default(),
            sandbox: SandboxConfig::default(),
            aggregate: AggregatorConfig::default(),
            context: ContextLimits::default(),
            gc: GcPolicy::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults, overlaid with `chunkwise.toml` from `state_dir` (if present)
    /// and then the process environment.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let mut config = Self::from_file_or_default(&state_dir.join(CONFIG_FILE_NAME))?;
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    pub fn from_file_or_default(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw).map_err(|e| {
                OrchestratorError::InvalidConfig(format!("{}: {e}", path.display()))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(OrchestratorError::io(path, err)),
        }
    }

    /// Apply `CHUNKWISE_*` overrides. Unknown variables are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "BATCH_WIDTH" => self.batch_width = parse_env(&key, &value)?,
                "MAX_PARALLEL" => self.max_parallel = parse_env(&key, &value)?,
                "CHUNK_TIMEOUT_MS" => self.chunk_timeout_ms = parse_env(&key, &value)?,
                "RETRY_ATTEMPTS" => self.retry.attempts = parse_env(&key, &value)?,
                "GRACE_PERIOD_MS" => self.grace_period_ms = parse_env(&key, &value)?,
                "CHUNK_SIZE" => self.chunking.size = parse_env(&key, &value)?,
                "CHUNK_OVERLAP" => self.chunking.overlap = parse_env(&key, &value)?,
                "STRATEGY" => {
                    self.chunking.strategy = match value.as_str() {
                        "fixed" => ChunkingStrategy::Fixed,
                        "structure" => ChunkingStrategy::Structure,
                        other => {
                            return Err(OrchestratorError::InvalidConfig(format!(
                                "{key}={other}: expected `fixed` or `structure`"
                            )))
                        }
                    }
                }
                "ISOLATION" => {
                    self.sandbox.isolation = match value.as_str() {
                        "process" => IsolationMode::Process,
                        "in_process" => IsolationMode::InProcess,
                        other => {
                            return Err(OrchestratorError::InvalidConfig(format!(
                                "{key}={other}: expected `process` or `in_process`"
                            )))
                        }
                    }
                }
                "EVAL_TIMEOUT_MS" => self.sandbox.eval_timeout_ms = parse_env(&key, &value)?,
                "SEARCH_TIMEOUT_MS" => self.sandbox.search_timeout_ms = parse_env(&key, &value)?,
                "MEMORY_LIMIT_MB" => self.sandbox.memory_limit_mb = parse_env(&key, &value)?,
                "REQUIRE_RESOURCE_LIMITS" => {
                    self.sandbox.require_resource_limits = parse_env(&key, &value)?
                }
                "WORKER_CMD" => self.worker.command = split_command(&value),
                "ESCALATION_CMD" => self.worker.escalation_command = split_command(&value),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(OrchestratorError::InvalidConfig(msg));
        if self.batch_width == 0 {
            return invalid("batch_width must be > 0".into());
        }
        if self.max_parallel == 0 {
            return invalid("max_parallel must be > 0".into());
        }
        if self.chunk_timeout_ms == 0 {
            return invalid("chunk_timeout_ms must be > 0".into());
        }
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold < 1.0) {
            return invalid(format!(
                "failure_rate_threshold must be in (0, 1), got {}",
                self.failure_rate_threshold
            ));
        }
        if self.fallback_after_batches == 0 {
            return invalid("fallback_after_batches must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.escalation.max_fraction)
            || self.escalation.max_cost < 0.0
            || self.escalation.cost_per_chunk < 0.0
        {
            return invalid("escalation budget must be non-negative with max_fraction <= 1".into());
        }
        self.retry.validate().map_err(OrchestratorError::InvalidConfig)?;
        self.chunking
            .validate()
            .map_err(|e| OrchestratorError::InvalidConfig(format!("chunking: {e}")))?;
        self.sandbox
            .validate()
            .map_err(|e| OrchestratorError::InvalidConfig(format!("sandbox: {e}")))?;
        self.aggregate.validate()?;
        if self.context.max_file_bytes == 0 || self.context.max_context_bytes == 0 {
            return invalid("context limits must be > 0".into());
        }
        Ok(())
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| OrchestratorError::InvalidConfig(format!("{key}={value}: {e}")))
}

/// Whitespace-separated program and arguments.
pub fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.batch_width, 5);
        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.grace_period(), Duration::from_secs(30));
    }

    #[test]
    fn file_then_env_layering() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "batch_width = 3\nmax_parallel = 2\n[chunking]\nsize = 1000\noverlap = 100\n",
        )
        .unwrap();
        let mut config = OrchestratorConfig::from_file_or_default(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!((config.batch_width, config.max_parallel), (3, 2));

        config
            .apply_env(vars(&[
                ("CHUNKWISE_MAX_PARALLEL", "1"),
                ("CHUNKWISE_ISOLATION", "in_process"),
                ("CHUNKWISE_WORKER_CMD", "python3 analyze.py --fast"),
                ("HOME", "/root"),
            ]))
            .unwrap();
        assert_eq!(config.batch_width, 3);
        assert_eq!(config.max_parallel, 1);
        assert_eq!(config.chunking.size, 1000);
        assert_eq!(config.sandbox.isolation, IsolationMode::InProcess);
        assert_eq!(config.worker.command, vec!["python3", "analyze.py", "--fast"]);
    }

    #[test]
    fn bad_values_are_configuration_errors() {
        let mut config = OrchestratorConfig::default();
        let err = config.apply_env(vars(&[("CHUNKWISE_BATCH_WIDTH", "five")])).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidConfig(_)));

        config.failure_rate_threshold = 1.0;
        assert!(config.validate().is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "batch_width = \"wide\"").unwrap();
        assert!(matches!(
            OrchestratorConfig::from_file_or_default(&path),
            Err(OrchestratorError::InvalidConfig(_))
        ));
    }
}
