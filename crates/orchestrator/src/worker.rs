//! The analysis worker seam. The orchestrator only needs "chunk text plus
//! query in, structured result out"; [`CommandWorker`] is the shipped
//! transport, speaking JSON over a child process's stdin and stdout.

use async_trait::async_trait;
use chunkwise_protocol::{ChunkResult, ResultStatus};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Exit status a worker uses for "try again later" (rate limit, overload).
pub const EXIT_TEMPORARY: i32 = 75;
/// Exit status a worker uses for "this chunk is beyond me".
pub const EXIT_QUALITY: i32 = 65;

const MAX_REPLY_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkerTier {
    Standard,
    Escalated,
}

/// What a worker receives for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AnalysisRequest {
    pub session_id: String,
    pub chunk_id: String,
    pub query: String,
    pub text: String,
    pub tier: WorkerTier,
    /// 1-based attempt number for this tier
    pub attempt: u32,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Worth retrying after a backoff
    #[error("transient worker failure: {0}")]
    Transient(String),

    /// The worker could not handle this chunk; may be escalated
    #[error("worker could not analyze the chunk: {0}")]
    Quality(String),

    /// Broken contract; neither retried nor escalated
    #[error("worker contract violation: {0}")]
    Fatal(String),

    #[error("worker timed out after {0} ms")]
    Timeout(u64),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    pub fn is_escalatable(&self) -> bool {
        matches!(self, Self::Quality(_))
    }
}

#[async_trait]
pub trait AnalysisWorker: Send + Sync {
    /// Analyze one chunk. A result the worker itself marks `failed` is
    /// reported as [`DispatchError::Quality`].
    async fn analyze(&self, request: &AnalysisRequest) -> Result<ChunkResult, DispatchError>;
}

/// Check a worker's answer against the request it was given.
pub fn accept_result(request: &AnalysisRequest, result: ChunkResult) -> Result<ChunkResult, DispatchError> {
    result
        .validate(&request.chunk_id)
        .map_err(DispatchError::Fatal)?;
    if result.status == ResultStatus::Failed {
        let reason = result
            .missing_info
            .first()
            .cloned()
            .unwrap_or_else(|| "worker reported failure".to_string());
        return Err(DispatchError::Quality(reason));
    }
    Ok(result)
}

/// Runs an external program once per chunk. The request goes to stdin as
/// JSON; the [`ChunkResult`] is read from stdout. Exit status
/// [`EXIT_TEMPORARY`] is transient, [`EXIT_QUALITY`] is a quality failure,
/// any other non-zero status is treated as transient.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandWorker {
    /// `argv[0]` is the program. `None` for an empty command line.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: PathBuf::from(program),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl AnalysisWorker for CommandWorker {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<ChunkResult, DispatchError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| DispatchError::Fatal(format!("encode request: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("CHUNKWISE_CHUNK_ID", &request.chunk_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DispatchError::Transient(format!("spawn {}: {e}", self.program.display())))?;

        // Write and read together: a worker may start replying before it
        // has drained its stdin.
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let write = async {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let read = async {
            let mut reply = Vec::new();
            if let Some(out) = stdout {
                out.take(MAX_REPLY_BYTES + 1).read_to_end(&mut reply).await?;
            }
            Ok::<Vec<u8>, std::io::Error>(reply)
        };
        let (written, reply) = tokio::join!(write, read);
        written.map_err(|e| DispatchError::Transient(format!("write request: {e}")))?;
        let stdout = reply.map_err(|e| DispatchError::Transient(format!("read reply: {e}")))?;
        let status = child
            .wait()
            .await
            .map_err(|e| DispatchError::Transient(format!("wait for worker: {e}")))?;

        match status.code() {
            Some(0) => {}
            Some(EXIT_QUALITY) => {
                return Err(DispatchError::Quality(format!(
                    "worker declined chunk {}",
                    request.chunk_id
                )))
            }
            Some(code) => {
                return Err(DispatchError::Transient(format!(
                    "worker exited with status {code}"
                )))
            }
            None => return Err(DispatchError::Transient("worker killed by a signal".to_string())),
        }
        if stdout.len() as u64 > MAX_REPLY_BYTES {
            return Err(DispatchError::Fatal(format!(
                "reply exceeds {MAX_REPLY_BYTES} bytes"
            )));
        }
        let result: ChunkResult = serde_json::from_slice(&stdout)
            .map_err(|e| DispatchError::Fatal(format!("malformed reply: {e}")))?;
        accept_result(request, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AnalysisRequest {
        AnalysisRequest {
            session_id: "s".into(),
            chunk_id: "chunk_00000".into(),
            query: "q".into(),
            text: "fn main() {}".into(),
            tier: WorkerTier::Standard,
            attempt: 1,
        }
    }

    #[test]
    fn worker_reported_failure_is_a_quality_failure() {
        let err = accept_result(&request(), ChunkResult::failed("chunk_00000", "too dense")).unwrap_err();
        assert_eq!(err, DispatchError::Quality("too dense".into()));
        assert!(err.is_escalatable());
        assert!(!err.is_retryable());
    }

    #[test]
    fn mismatched_chunk_is_fatal() {
        let mut result = ChunkResult::failed("chunk_00001", "x");
        result.status = ResultStatus::Completed;
        result.missing_info.clear();
        assert!(matches!(accept_result(&request(), result), Err(DispatchError::Fatal(_))));
    }

    #[test]
    fn empty_command_line_has_no_worker() {
        assert!(CommandWorker::from_argv(&[]).is_none());
        assert!(CommandWorker::from_argv(&["python3".to_string()]).is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_worker_speaks_json_over_stdio() {
        let script = r#"cat >/dev/null; printf '{"chunk_id":"chunk_00000","status":"completed","findings":[{"point":"entry point","confidence":"high","source":{"file":"main.rs","line":1}}]}'"#;
        let worker = CommandWorker::from_argv(&["sh".into(), "-c".into(), script.into()]).unwrap();
        let result = worker.analyze(&request()).await.unwrap();
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.status, ResultStatus::Completed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_reply_with_a_large_request_does_not_stall() {
        // The reply alone overflows a pipe buffer before any input is read.
        let script = r#"printf '{"chunk_id":"chunk_00000","status":"partial","partial_answer":"'; head -c 262144 /dev/zero | tr '\0' a; printf '"}'; cat >/dev/null"#;
        let worker = CommandWorker::from_argv(&["sh".into(), "-c".into(), script.into()]).unwrap();
        let mut large = request();
        large.text = "x".repeat(4 * 1024 * 1024);
        let result = tokio::time::timeout(std::time::Duration::from_secs(20), worker.analyze(&large))
            .await
            .expect("worker stalled");
        let result = result.unwrap();
        assert_eq!(result.status, ResultStatus::Partial);
        assert_eq!(result.partial_answer.map(|a| a.len()), Some(262_144));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_statuses_are_classified() {
        let temporary = CommandWorker::from_argv(&["sh".into(), "-c".into(), "cat >/dev/null; exit 75".into()]).unwrap();
        assert!(matches!(temporary.analyze(&request()).await, Err(DispatchError::Transient(_))));

        let quality = CommandWorker::from_argv(&["sh".into(), "-c".into(), "cat >/dev/null; exit 65".into()]).unwrap();
        assert!(matches!(quality.analyze(&request()).await, Err(DispatchError::Quality(_))));

        let garbage = CommandWorker::from_argv(&["sh".into(), "-c".into(), "cat >/dev/null; echo nope".into()]).unwrap();
        assert!(matches!(garbage.analyze(&request()).await, Err(DispatchError::Fatal(_))));
    }
}
