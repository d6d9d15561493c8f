//! The worker side of the sandbox and the wire format between parent and
//! worker.
//!
//! One request per process: the parent writes a JSON [`WorkerRequest`] to the
//! worker's stdin and closes it, the worker writes one JSON [`WorkerReply`] to
//! stdout and exits. Nothing else is ever written to stdout.

use crate::config::EvalLimits;
use crate::error::{Result, SandboxError};
use crate::guard;
use crate::interp::{evaluate, EvalOutcome, ScoutData};
use crate::search::{check_pattern, run_search, SearchOptions, SearchOutcome, SearchRange};
use chunkwise_chunker::ChunkerConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

/// Where the worker finds the session context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextSource {
    Inline { text: String },
    /// A file the parent wrote into the session directory
    File { path: PathBuf },
}

/// The data an evaluation or search runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Scope {
    pub context: ContextSource,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Scope {
    pub fn inline(text: impl Into<String>) -> Self {
        Self::with_source(ContextSource::Inline { text: text.into() })
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::with_source(ContextSource::File { path: path.into() })
    }

    fn with_source(context: ContextSource) -> Self {
        let defaults = ChunkerConfig::default();
        Self {
            context,
            chunk_size: defaults.size,
            chunk_overlap: defaults.overlap,
        }
    }

    /// Geometry reported by `chunk_spans()` when called without arguments.
    pub fn with_chunking(mut self, size: usize, overlap: usize) -> Self {
        self.chunk_size = size;
        self.chunk_overlap = overlap;
        self
    }

    fn load(&self) -> Result<String> {
        match &self.context {
            ContextSource::Inline { text } => Ok(text.clone()),
            ContextSource::File { path } => std::fs::read_to_string(path).map_err(|e| {
                SandboxError::worker(format!("failed to read context {}: {e}", path.display()))
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerRequest {
    Eval {
        source: String,
        scope: Scope,
        limits: EvalLimits,
        timeout_ms: u64,
    },
    Search {
        pattern: String,
        scope: Scope,
        range: Option<SearchRange>,
        options: SearchOptions,
        timeout_ms: u64,
    },
}

impl WorkerRequest {
    pub fn timeout_ms(&self) -> u64 {
        match self {
            Self::Eval { timeout_ms, .. } | Self::Search { timeout_ms, .. } => *timeout_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReply {
    Eval { outcome: EvalOutcome },
    Search { outcome: SearchOutcome },
    Failed { error: SandboxError },
}

impl From<SandboxError> for WorkerReply {
    fn from(error: SandboxError) -> Self {
        Self::Failed { error }
    }
}

/// Execute one request in the current thread. All four gates run here again
/// even when the parent already checked them.
pub fn handle(request: WorkerRequest, cancel: Option<&AtomicBool>) -> WorkerReply {
    let started = Instant::now();
    let deadline = started + Duration::from_millis(request.timeout_ms());
    let result = match request {
        WorkerRequest::Eval {
            source,
            scope,
            limits,
            timeout_ms,
        } => run_eval(&source, &scope, limits, deadline, timeout_ms, cancel)
            .map(|outcome| WorkerReply::Eval { outcome }),
        WorkerRequest::Search {
            pattern,
            scope,
            range,
            options,
            timeout_ms,
        } => check_pattern(&pattern)
            .and_then(|()| scope.load())
            .and_then(|text| run_search(&pattern, &text, range, &options, deadline, timeout_ms))
            .map(|outcome| WorkerReply::Search { outcome }),
    };
    result.unwrap_or_else(WorkerReply::from)
}

fn run_eval(
    source: &str,
    scope: &Scope,
    limits: EvalLimits,
    deadline: Instant,
    timeout_ms: u64,
    cancel: Option<&AtomicBool>,
) -> Result<EvalOutcome> {
    let program = guard::vet(source)?;
    let text = scope.load()?;
    let data = ScoutData::new(&text, scope.chunk_size, scope.chunk_overlap);
    evaluate(&program, &data, limits, deadline, timeout_ms, cancel)
}

/// Worker entry point: one request from stdin, one reply to stdout.
/// Returns the process exit code.
pub fn serve_stdio() -> i32 {
    let mut input = String::new();
    let reply = match std::io::stdin().read_to_string(&mut input) {
        Ok(_) => match serde_json::from_str::<WorkerRequest>(&input) {
            Ok(request) => handle(request, None),
            Err(e) => SandboxError::worker(format!("malformed request: {e}")).into(),
        },
        Err(e) => SandboxError::worker(format!("failed to read request: {e}")).into(),
    };
    drop(input);

    let bytes = match serde_json::to_vec(&reply) {
        Ok(bytes) => bytes,
        Err(_) => return 2,
    };
    let mut stdout = std::io::stdout().lock();
    if stdout.write_all(&bytes).and_then(|()| stdout.flush()).is_err() {
        return 2;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn eval_request(source: &str, context: &str) -> WorkerRequest {
        WorkerRequest::Eval {
            source: source.to_string(),
            scope: Scope::inline(context),
            limits: EvalLimits::default(),
            timeout_ms: 2_000,
        }
    }

    #[test]
    fn request_wire_format_is_tagged() {
        let json = serde_json::to_value(eval_request("1", "")).unwrap();
        assert_eq!(json["op"], "eval");
        assert_eq!(json["scope"]["context"]["type"], "inline");
    }

    #[test]
    fn handle_evaluates_against_the_scope() {
        match handle(eval_request("len(context.split())", "a b c"), None) {
            WorkerReply::Eval { outcome } => assert_eq!(outcome.value, serde_json::json!(3)),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn handle_reports_gate_failures_as_replies() {
        let reply = handle(eval_request("__import__('os')", ""), None);
        let WorkerReply::Failed { error } = reply else {
            panic!("expected failure");
        };
        assert!(error.is_gate_rejection());
    }

    #[test]
    fn handle_searches_file_scopes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.txt");
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();
        let request = WorkerRequest::Search {
            pattern: "t\\w+".into(),
            scope: Scope::file(&path),
            range: None,
            options: SearchOptions::default(),
            timeout_ms: 2_000,
        };
        match handle(request, None) {
            WorkerReply::Search { outcome } => {
                let lines: Vec<usize> = outcome.matches.iter().map(|m| m.line).collect();
                assert_eq!(lines, vec![2, 3]);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn missing_context_file_is_a_worker_failure() {
        let request = eval_request("1", "");
        let WorkerRequest::Eval { source, limits, timeout_ms, .. } = request else {
            unreachable!()
        };
        let reply = handle(
            WorkerRequest::Eval {
                source,
                scope: Scope::file("/nonexistent/chunkwise/context.txt"),
                limits,
                timeout_ms,
            },
            None,
        );
        assert!(matches!(reply, WorkerReply::Failed { error: SandboxError::Worker { .. } }));
    }

    #[test]
    fn reply_round_trips_failures() {
        let reply = WorkerReply::from(SandboxError::Timeout { limit_ms: 5 });
        let json = serde_json::to_string(&reply).unwrap();
        assert_eq!(serde_json::from_str::<WorkerReply>(&json).unwrap(), reply);
    }
}
