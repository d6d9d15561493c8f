//! Sandboxed evaluation of exploration programs and bounded pattern search.
//!
//! A program passes four gates before it can produce a value:
//!
//! 1. the source text is scanned for banned capability patterns,
//! 2. the parsed tree may only contain allow-listed node kinds,
//! 3. attribute names are checked statically and again at run time,
//! 4. names resolve only to program variables, builtins and helpers.
//!
//! Execution then happens in a short-lived worker process with OS resource
//! limits ([`IsolationMode::Process`]), or cooperatively on a dedicated
//! thread ([`IsolationMode::InProcess`]).

pub mod ast;
pub mod config;
pub mod error;
pub mod guard;
mod interp;
mod lexer;
mod limits;
pub mod parser;
pub mod search;
mod value;
pub mod worker;

pub use config::{EvalLimits, IsolationMode, SandboxConfig};
pub use error::{Result, RuntimeKind, SandboxError};
pub use interp::EvalOutcome;
pub use search::{SearchMatch, SearchOptions, SearchOutcome, SearchRange};
pub use worker::{ContextSource, Scope, WorkerReply, WorkerRequest};

use limits::WorkerLimits;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

/// Slack on top of the request timeout so the worker can report its own
/// timeout before the parent kills it.
const REPLY_GRACE: Duration = Duration::from_millis(500);
/// How long to wait for a killed worker to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(2);
const IN_PROCESS_STACK: usize = 64 * 1024 * 1024;

/// How to launch the worker executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Re-run the current executable with a worker subcommand.
    pub fn current_exe(subcommand: &str) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg(subcommand))
    }
}

pub struct Sandbox {
    config: SandboxConfig,
    worker: Option<WorkerCommand>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig, worker: Option<WorkerCommand>) -> Result<Self> {
        config.validate().map_err(SandboxError::configuration)?;
        match config.isolation {
            IsolationMode::Process => {
                if worker.is_none() {
                    return Err(SandboxError::configuration(
                        "process isolation needs a worker executable",
                    ));
                }
                if config.require_resource_limits && !limits::supported() {
                    return Err(SandboxError::configuration(
                        "resource limits cannot be applied on this platform; \
                         set sandbox.require_resource_limits = false to run without them",
                    ));
                }
            }
            IsolationMode::InProcess => {
                if config.require_resource_limits {
                    return Err(SandboxError::configuration(
                        "in-process isolation cannot apply memory or CPU limits; \
                         set sandbox.require_resource_limits = false or use process isolation",
                    ));
                }
            }
        }
        Ok(Self { config, worker })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Evaluate `source` against `scope`. Gate rejections are reported
    /// without starting a worker.
    pub async fn evaluate(&self, source: &str, scope: &Scope) -> Result<EvalOutcome> {
        guard::vet(source)?;
        let request = WorkerRequest::Eval {
            source: source.to_string(),
            scope: scope.clone(),
            limits: self.config.limits(),
            timeout_ms: self.config.eval_timeout_ms,
        };
        match self.dispatch(request).await? {
            WorkerReply::Eval { outcome } => {
                log::debug!("evaluation finished in {} steps", outcome.steps);
                Ok(outcome)
            }
            WorkerReply::Failed { error } => Err(error),
            WorkerReply::Search { .. } => Err(SandboxError::worker("worker answered an eval with a search")),
        }
    }

    /// Search `scope` (optionally only `range`) for `pattern`.
    pub async fn search(
        &self,
        pattern: &str,
        scope: &Scope,
        range: Option<SearchRange>,
        options: &SearchOptions,
    ) -> Result<SearchOutcome> {
        search::check_pattern(pattern)?;
        let request = WorkerRequest::Search {
            pattern: pattern.to_string(),
            scope: scope.clone(),
            range,
            options: options.clone(),
            timeout_ms: self.config.search_timeout_ms,
        };
        match self.dispatch(request).await? {
            WorkerReply::Search { outcome } => Ok(outcome),
            WorkerReply::Failed { error } => Err(error),
            WorkerReply::Eval { .. } => Err(SandboxError::worker("worker answered a search with an eval")),
        }
    }

    async fn dispatch(&self, request: WorkerRequest) -> Result<WorkerReply> {
        match (self.config.isolation, &self.worker) {
            (IsolationMode::Process, Some(worker)) => self.run_process(worker, &request).await,
            (IsolationMode::Process, None) => Err(SandboxError::configuration(
                "process isolation needs a worker executable",
            )),
            (IsolationMode::InProcess, _) => self.run_thread(request).await,
        }
    }

    async fn run_process(&self, worker: &WorkerCommand, request: &WorkerRequest) -> Result<WorkerReply> {
        let timeout_ms = request.timeout_ms();
        let payload = serde_json::to_vec(request)
            .map_err(|e| SandboxError::worker(format!("failed to encode request: {e}")))?;

        let mut cmd = Command::new(&worker.program);
        cmd.args(&worker.args)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        #[cfg(unix)]
        if self.config.require_resource_limits {
            let worker_limits = WorkerLimits::for_timeout(&self.config, timeout_ms);
            unsafe {
                cmd.pre_exec(move || limits::apply(worker_limits));
            }
        }
        #[cfg(not(unix))]
        let _ = WorkerLimits::for_timeout(&self.config, timeout_ms);

        let mut child = cmd.spawn().map_err(|e| {
            SandboxError::worker(format!("failed to start {}: {e}", worker.program.display()))
        })?;
        log::trace!("sandbox worker started (pid {:?})", child.id());

        let cap = self.config.max_response_bytes;
        let limit = Duration::from_millis(timeout_ms) + REPLY_GRACE;
        let exchanged = tokio::time::timeout(limit, exchange(&mut child, &payload, cap)).await;
        let (bytes, status) = match exchanged {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                reap(&mut child).await;
                return Err(SandboxError::worker(format!("worker i/o failed: {e}")));
            }
            Err(_) => {
                log::debug!("sandbox worker exceeded {timeout_ms} ms, killing it");
                reap(&mut child).await;
                return Err(SandboxError::Timeout { limit_ms: timeout_ms });
            }
        };

        if bytes.len() > cap {
            reap(&mut child).await;
            return Err(SandboxError::OutputTooLarge { limit: cap });
        }
        let Some(status) = status else {
            return Err(SandboxError::worker("worker did not exit after replying"));
        };
        if let Some(error) = abnormal_exit(status, timeout_ms, self.config.memory_limit_mb) {
            return Err(error);
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            SandboxError::worker(format!("unreadable worker reply ({status}): {e}"))
        })
    }

    async fn run_thread(&self, request: WorkerRequest) -> Result<WorkerReply> {
        let timeout_ms = request.timeout_ms();
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::Builder::new()
            .name("chunkwise-eval".to_string())
            .stack_size(IN_PROCESS_STACK)
            .spawn(move || {
                let reply = worker::handle(request, Some(&flag));
                let _ = tx.send(reply);
            })
            .map_err(|e| SandboxError::worker(format!("failed to start evaluation thread: {e}")))?;

        let limit = Duration::from_millis(timeout_ms) + REPLY_GRACE;
        let reply = match tokio::time::timeout(limit, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(SandboxError::worker("evaluation thread exited without a reply")),
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                return Err(SandboxError::Timeout { limit_ms: timeout_ms });
            }
        };
        let size = serde_json::to_vec(&reply).map(|v| v.len()).unwrap_or(usize::MAX);
        if size > self.config.max_response_bytes {
            return Err(SandboxError::OutputTooLarge {
                limit: self.config.max_response_bytes,
            });
        }
        Ok(reply)
    }
}

/// Write the request, read at most `cap + 1` reply bytes, then wait for
/// exit. `None` status means the worker overflowed the cap and was left
/// running for the caller to kill.
async fn exchange(
    child: &mut Child,
    payload: &[u8],
    cap: usize,
) -> std::io::Result<(Vec<u8>, Option<ExitStatus>)> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("worker stdin unavailable"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("worker stdout unavailable"))?;

    // A worker that dies early closes its end; its exit status explains why.
    let _ = stdin.write_all(payload).await;
    drop(stdin);

    let mut bytes = Vec::new();
    stdout.take(cap as u64 + 1).read_to_end(&mut bytes).await?;
    if bytes.len() > cap {
        return Ok((bytes, None));
    }
    let status = child.wait().await?;
    Ok((bytes, Some(status)))
}

async fn reap(child: &mut Child) {
    let _ = child.start_kill();
    let _ = tokio::time::timeout(KILL_WAIT, child.wait()).await;
}

#[cfg(unix)]
fn abnormal_exit(status: ExitStatus, timeout_ms: u64, memory_limit_mb: u64) -> Option<SandboxError> {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(libc::SIGXCPU) | Some(libc::SIGKILL) => Some(SandboxError::Timeout { limit_ms: timeout_ms }),
        Some(signal) => Some(SandboxError::resource(format!(
            "worker terminated by signal {signal} (memory limit {memory_limit_mb} MB)"
        ))),
        None if status.success() => None,
        None => Some(SandboxError::worker(format!("worker exited with {status}"))),
    }
}

#[cfg(not(unix))]
fn abnormal_exit(status: ExitStatus, _timeout_ms: u64, _memory_limit_mb: u64) -> Option<SandboxError> {
    if status.success() {
        None
    } else {
        Some(SandboxError::worker(format!("worker exited with {status}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_process() -> SandboxConfig {
        SandboxConfig {
            isolation: IsolationMode::InProcess,
            require_resource_limits: false,
            ..SandboxConfig::default()
        }
    }

    #[test]
    fn in_process_requires_opting_out_of_limits() {
        let config = SandboxConfig {
            isolation: IsolationMode::InProcess,
            ..SandboxConfig::default()
        };
        let err = Sandbox::new(config, None).err().unwrap();
        assert!(matches!(err, SandboxError::Configuration { .. }));
        assert!(Sandbox::new(in_process(), None).is_ok());
    }

    #[test]
    fn process_mode_requires_a_worker() {
        let err = Sandbox::new(SandboxConfig::default(), None).err().unwrap();
        assert!(matches!(err, SandboxError::Configuration { .. }));
    }

    #[tokio::test]
    async fn in_process_evaluation_and_search() {
        let sandbox = Sandbox::new(in_process(), None).unwrap();
        let scope = Scope::inline("alpha\nbeta\ngamma\n");
        let outcome = sandbox.evaluate("len(head(2))", &scope).await.unwrap();
        assert_eq!(outcome.value, serde_json::json!(2));

        let found = sandbox
            .search("^g", &scope, None, &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(found.matches.len(), 1);
        assert_eq!(found.matches[0].line, 3);
    }

    #[tokio::test]
    async fn in_process_runaway_loop_times_out() {
        let config = SandboxConfig {
            eval_timeout_ms: 200,
            ..in_process()
        };
        let sandbox = Sandbox::new(config, None).unwrap();
        let started = std::time::Instant::now();
        let err = sandbox
            .evaluate("while True:\n    pass\n", &Scope::inline(""))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn gate_rejections_skip_the_worker() {
        // No worker executable exists; the gate must answer first.
        let config = SandboxConfig {
            require_resource_limits: false,
            ..SandboxConfig::default()
        };
        let sandbox = Sandbox::new(config, Some(WorkerCommand::new("/nonexistent/worker"))).unwrap();
        let err = sandbox
            .evaluate("open('/etc/passwd').read()", &Scope::inline(""))
            .await
            .unwrap_err();
        assert!(err.is_gate_rejection());
        let err = sandbox
            .search("(a+)+$", &Scope::inline(""), None, &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::RejectedPattern { .. }));
    }
}
