use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where evaluations and searches execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// A short-lived worker process with OS resource limits, killed on timeout
    Process,
    /// A thread in the calling process, stopped cooperatively at step checks
    InProcess,
}

impl Default for IsolationMode {
    fn default() -> Self {
        Self::Process
    }
}

/// Sandbox limits and isolation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SandboxConfig {
    pub isolation: IsolationMode,

    /// Wall-clock limit for one expression
    pub eval_timeout_ms: u64,

    /// Wall-clock limit for one search
    pub search_timeout_ms: u64,

    /// Address-space ceiling for the worker process
    pub memory_limit_mb: u64,

    /// Captured `print` output kept per evaluation; the rest is replaced by a
    /// truncation marker
    pub max_output_bytes: usize,

    /// Largest worker response accepted over the pipe
    pub max_response_bytes: usize,

    /// Largest string an evaluation may build
    pub max_string_bytes: usize,

    /// Largest list/dict/set an evaluation may build
    pub max_container_len: usize,

    /// Interpreter step budget per evaluation
    pub max_steps: u64,

    /// Maximum nested lambda call depth
    pub max_call_depth: usize,

    /// Refuse to evaluate when OS resource limits cannot be applied
    pub require_resource_limits: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationMode::Process,
            eval_timeout_ms: 5_000,
            search_timeout_ms: 5_000,
            memory_limit_mb: 1_024,
            max_output_bytes: 64 * 1024,
            max_response_bytes: 8 * 1024 * 1024,
            max_string_bytes: 16 * 1024 * 1024,
            max_container_len: 1_000_000,
            max_steps: 50_000_000,
            max_call_depth: 64,
            require_resource_limits: true,
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.eval_timeout_ms == 0 || self.search_timeout_ms == 0 {
            return Err("sandbox timeouts must be > 0".to_string());
        }
        if self.memory_limit_mb < 64 {
            return Err(format!(
                "memory_limit_mb ({}) is too small for the worker; use at least 64",
                self.memory_limit_mb
            ));
        }
        if self.max_output_bytes == 0 || self.max_response_bytes <= self.max_output_bytes {
            return Err(
                "max_response_bytes must be larger than max_output_bytes, and both > 0".to_string(),
            );
        }
        if self.max_string_bytes == 0 || self.max_container_len == 0 || self.max_steps == 0 {
            return Err("string, container and step caps must be > 0".to_string());
        }
        if self.max_call_depth == 0 || self.max_call_depth > 256 {
            return Err("max_call_depth must be between 1 and 256".to_string());
        }
        Ok(())
    }

    pub fn eval_timeout(&self) -> Duration {
        Duration::from_millis(self.eval_timeout_ms)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    pub(crate) fn limits(&self) -> EvalLimits {
        EvalLimits {
            max_output_bytes: self.max_output_bytes,
            max_string_bytes: self.max_string_bytes,
            max_container_len: self.max_container_len,
            max_steps: self.max_steps,
            max_call_depth: self.max_call_depth,
        }
    }
}

/// The subset of limits the interpreter itself enforces; shipped to the
/// worker with every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EvalLimits {
    pub max_output_bytes: usize,
    pub max_string_bytes: usize,
    pub max_container_len: usize,
    pub max_steps: u64,
    pub max_call_depth: usize,
}

impl Default for EvalLimits {
    fn default() -> Self {
        SandboxConfig::default().limits()
    }
}
