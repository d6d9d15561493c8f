//! Batch fan-out: bounded concurrency within a batch, per-chunk deadlines
//! and retries, and the policies that decide fallback and escalation.

use crate::cancel::CancellationManager;
use crate::config::EscalationConfig;
use crate::retry::RetryPolicy;
use crate::state::EscalationLedger;
use crate::worker::{AnalysisRequest, AnalysisWorker, DispatchError};
use chunkwise_protocol::ChunkResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Concurrent dispatches; 1 means strictly sequential
    pub parallel: usize,
}

#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub chunk_id: String,
    pub attempts: u32,
    pub result: Result<ChunkResult, DispatchError>,
}

#[derive(Debug)]
pub enum BatchRun {
    /// Every chunk reached an outcome, in dispatch order
    Finished(Vec<ChunkOutcome>),
    /// Cancellation required dropping in-flight work
    Abandoned,
}

/// Split chunk ids into consecutive batches of at most `width`.
pub fn plan_batches(ids: &[String], width: usize) -> Vec<Vec<String>> {
    ids.chunks(width.max(1)).map(<[String]>::to_vec).collect()
}

/// More than `threshold` of the batch failed.
pub fn is_failing_batch(failed: usize, total: usize, threshold: f64) -> bool {
    total > 0 && failed as f64 / total as f64 > threshold
}

/// How many more chunks this session may escalate.
pub fn escalation_allowance(
    config: &EscalationConfig,
    total_chunks: usize,
    ledger: &EscalationLedger,
) -> usize {
    let by_fraction = ((config.max_fraction * total_chunks as f64) + 1e-9).floor() as usize;
    let by_fraction = by_fraction.saturating_sub(ledger.escalated);
    if config.cost_per_chunk <= 0.0 {
        return by_fraction;
    }
    let remaining = (config.max_cost - ledger.cost_spent).max(0.0);
    let by_cost = ((remaining / config.cost_per_chunk) + 1e-9).floor() as usize;
    by_fraction.min(by_cost)
}

/// Dispatch one batch and wait for every outcome. Transient failures and
/// timeouts are retried per `settings.retry`.
pub async fn run_batch(
    worker: Arc<dyn AnalysisWorker>,
    requests: Vec<AnalysisRequest>,
    settings: &DispatchSettings,
    cancel: &CancellationManager,
) -> BatchRun {
    let permits = Arc::new(Semaphore::new(settings.parallel.max(1)));
    let mut tasks = JoinSet::new();
    let chunk_ids: Vec<String> = requests.iter().map(|r| r.chunk_id.clone()).collect();
    for (position, request) in requests.into_iter().enumerate() {
        let worker = Arc::clone(&worker);
        let permits = Arc::clone(&permits);
        let timeout = settings.timeout;
        let retry = settings.retry.clone();
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            (position, dispatch_with_retry(worker, request, timeout, &retry).await)
        });
    }

    let mut outcomes: Vec<Option<ChunkOutcome>> = vec![None; chunk_ids.len()];
    loop {
        tokio::select! {
            biased;
            _ = cancel.abandoned() => {
                tasks.abort_all();
                log::warn!("abandoning in-flight batch");
                return BatchRun::Abandoned;
            }
            joined = tasks.join_next() => match joined {
                Some(Ok((position, outcome))) => outcomes[position] = Some(outcome),
                Some(Err(err)) => log::error!("dispatch task failed: {err}"),
                None => break,
            }
        }
    }
    let outcomes = outcomes
        .into_iter()
        .zip(chunk_ids)
        .map(|(outcome, chunk_id)| {
            outcome.unwrap_or_else(|| ChunkOutcome {
                chunk_id,
                attempts: 1,
                result: Err(DispatchError::Fatal("dispatch task did not complete".to_string())),
            })
        })
        .collect();
    BatchRun::Finished(outcomes)
}

async fn dispatch_with_retry(
    worker: Arc<dyn AnalysisWorker>,
    mut request: AnalysisRequest,
    timeout: Duration,
    retry: &RetryPolicy,
) -> ChunkOutcome {
    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        request.attempt = attempt;
        let result = match tokio::time::timeout(timeout, worker.analyze(&request)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(timeout_ms)),
        };
        match result {
            Err(err) if err.is_retryable() && retry.should_retry(attempt) => {
                let delay = retry.backoff(attempt);
                log::warn!(
                    "{} attempt {attempt} failed ({err}); retrying in {} ms",
                    request.chunk_id,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            result => {
                return ChunkOutcome {
                    chunk_id: request.chunk_id,
                    attempts: attempt,
                    result,
                }
            }
        }
    }
}
