mod support;

use chunkwise_orchestrator::{
    CancellationManager, DispatchError, ExportFormat, MapOptions, OrchestratorError, Phase,
    ProgressKind, Workers,
};
use chunkwise_protocol::{ChunkResult, Classify, ErrorCategory};
use pretty_assertions::assert_eq;
use std::time::Duration;
use support::{chunk_number, completed, finding, test_config, workers, Harness, ScriptedWorker};

fn no_cancel() -> CancellationManager {
    CancellationManager::new(Duration::from_secs(30))
}

#[tokio::test]
async fn full_run_reduces_to_a_report() {
    let harness = Harness::with_large_file(test_config());
    let (id, chunks) = harness.init_and_chunk().await;
    assert!(chunks >= 11, "fixture should produce many chunks, got {chunks}");

    let worker = ScriptedWorker::new(|request| {
        let findings = if request.chunk_id == "chunk_00000" {
            vec![finding("the fox jumps over the lazy dog", "notes.txt:1")]
        } else {
            Vec::new()
        };
        Ok(completed(&request.chunk_id, findings))
    });
    let summary = harness
        .orchestrator
        .map(Some(&id), MapOptions::default(), &workers(worker.clone()), &no_cancel())
        .await
        .expect("map");
    assert_eq!(summary.completed, chunks);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.remaining, 0);
    assert_eq!(summary.batches, chunks.div_ceil(5));
    assert_eq!(worker.calls().len(), chunks);

    let report = harness.orchestrator.reduce(Some(&id)).await.expect("reduce");
    assert_eq!(report.stats.chunks, chunks);
    assert_eq!(report.findings.len(), 1);

    let status = harness.orchestrator.status(Some(&id)).await.expect("status");
    assert_eq!(status.phase, Phase::Completed);
    assert_eq!(status.completed, chunks);

    // Reducing a completed session returns the stored report.
    let again = harness.orchestrator.reduce(Some(&id)).await.expect("reduce again");
    assert_eq!(again.generated_at_ms, report.generated_at_ms);

    let markdown = harness
        .orchestrator
        .export(Some(&id), ExportFormat::Markdown)
        .await
        .expect("export");
    assert!(markdown.contains("the fox jumps over the lazy dog"));
}

#[tokio::test]
async fn phases_cannot_be_skipped() {
    let harness = Harness::with_large_file(test_config());
    let id = harness.init("anything").await;

    let err = harness
        .orchestrator
        .map(Some(&id), MapOptions::default(), &workers(ScriptedWorker::succeeding()), &no_cancel())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidPhase { .. }), "{err:?}");

    let err = harness.orchestrator.reduce(Some(&id)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidPhase { .. }), "{err:?}");

    let err = harness
        .orchestrator
        .export(Some(&id), ExportFormat::Json)
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);
}

#[tokio::test]
async fn forced_cancel_then_resume_skips_completed_chunks() {
    let harness = Harness::with_large_file(test_config());
    let (id, chunks) = harness.init_and_chunk().await;

    let cancel = no_cancel();
    let trigger = cancel.clone();
    let first = ScriptedWorker::new(move |request| {
        if chunk_number(&request.chunk_id) >= 5 {
            trigger.request();
            trigger.request();
        }
        Ok(completed(&request.chunk_id, Vec::new()))
    });
    let err = harness
        .orchestrator
        .map(Some(&id), MapOptions::default(), &workers(first), &cancel)
        .await
        .unwrap_err();
    assert!(
        matches!(err, OrchestratorError::Cancelled { ref mode, checkpointed: 1 } if mode == "forced"),
        "{err:?}"
    );

    let status = harness.orchestrator.status(Some(&id)).await.expect("status");
    assert_eq!(status.completed, 5);
    assert_eq!(status.last_checkpoint_batch, Some(0));
    let store = harness.orchestrator.store();
    assert!(store.read_result(&id, "chunk_00005").await.expect("read").is_none());

    let second = ScriptedWorker::succeeding();
    let summary = harness
        .orchestrator
        .resume(Some(&id), MapOptions::default(), &workers(second.clone()), &no_cancel())
        .await
        .expect("resume");
    assert_eq!(summary.completed, chunks - 5);
    let calls = second.calls();
    assert_eq!(calls.len(), chunks - 5);
    assert!(calls.iter().all(|id| chunk_number(id) >= 5), "{calls:?}");

    // Nothing left to do: another resume dispatches nothing.
    let idle = ScriptedWorker::succeeding();
    let summary = harness
        .orchestrator
        .resume(Some(&id), MapOptions::default(), &workers(idle.clone()), &no_cancel())
        .await
        .expect("idle resume");
    assert_eq!(summary.batches, 0);
    assert!(idle.calls().is_empty());
}

/// Same answer for a chunk on every call; chunks share points so merging
/// has duplicates to fold.
fn sighting(chunk_id: &str) -> ChunkResult {
    let n = chunk_number(chunk_id);
    let mut findings = vec![finding(
        &format!("the fox is seen near marker {}", n % 4),
        &format!("notes.txt:{}", n % 4 + 1),
    )];
    if n == 7 {
        findings.push(finding("the fox never jumps over the lazy dog", "notes.txt:1"));
    }
    completed(chunk_id, findings)
}

#[tokio::test]
async fn resumed_run_reduces_to_the_same_report() {
    let straight = Harness::with_large_file(test_config());
    let (id, chunks) = straight.init_and_chunk().await;
    straight
        .orchestrator
        .map(
            Some(&id),
            MapOptions::default(),
            &workers(ScriptedWorker::new(|request| Ok(sighting(&request.chunk_id)))),
            &no_cancel(),
        )
        .await
        .expect("map");
    let expected = straight.orchestrator.reduce(Some(&id)).await.expect("reduce");
    assert!(!expected.findings.is_empty());

    let interrupted = Harness::with_large_file(test_config());
    let (id, resumed_chunks) = interrupted.init_and_chunk().await;
    assert_eq!(resumed_chunks, chunks);
    let cancel = no_cancel();
    let trigger = cancel.clone();
    let first = ScriptedWorker::new(move |request| {
        if chunk_number(&request.chunk_id) >= 5 {
            trigger.request();
            trigger.request();
        }
        Ok(sighting(&request.chunk_id))
    });
    let err = interrupted
        .orchestrator
        .map(Some(&id), MapOptions::default(), &workers(first), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled { .. }), "{err:?}");
    interrupted
        .orchestrator
        .resume(
            Some(&id),
            MapOptions::default(),
            &workers(ScriptedWorker::new(|request| Ok(sighting(&request.chunk_id)))),
            &no_cancel(),
        )
        .await
        .expect("resume");
    let actual = interrupted.orchestrator.reduce(Some(&id)).await.expect("reduce");

    assert_eq!(actual.findings, expected.findings);
    assert_eq!(actual.contradictions, expected.contradictions);
    assert_eq!(actual.missing_info, expected.missing_info);
    assert_eq!(actual.failed_chunks, expected.failed_chunks);
    assert_eq!(actual.stats, expected.stats);
}

#[tokio::test]
async fn graceful_cancel_finishes_and_checkpoints_the_running_batch() {
    let harness = Harness::with_large_file(test_config());
    let (id, chunks) = harness.init_and_chunk().await;

    let cancel = no_cancel();
    let trigger = cancel.clone();
    let worker = ScriptedWorker::new(move |request| {
        if request.chunk_id == "chunk_00000" {
            trigger.request();
        }
        Ok(completed(&request.chunk_id, Vec::new()))
    });
    let err = harness
        .orchestrator
        .map(Some(&id), MapOptions::default(), &workers(worker.clone()), &cancel)
        .await
        .unwrap_err();
    assert!(
        matches!(err, OrchestratorError::Cancelled { ref mode, checkpointed: 1 } if mode == "graceful"),
        "{err:?}"
    );
    assert_eq!(err.category(), ErrorCategory::Cancelled);
    assert_eq!(worker.calls().len(), 5);

    let status = harness.orchestrator.status(Some(&id)).await.expect("status");
    assert_eq!(status.completed, 5);
    assert_eq!(status.pending, chunks - 5);
    assert_eq!(status.last_checkpoint_batch, Some(0));

    let events = harness.orchestrator.store().read_progress(&id).await.expect("progress");
    assert!(events
        .iter()
        .any(|e| matches!(&e.kind, ProgressKind::CancelRequested { mode } if mode == "graceful")));
}

#[tokio::test]
async fn consecutive_failing_batches_fall_back_to_sequential_dispatch() {
    let harness = Harness::with_large_file(test_config());
    let (id, chunks) = harness.init_and_chunk().await;

    let worker = ScriptedWorker::new(|request| {
        if chunk_number(&request.chunk_id) < 10 {
            Err(DispatchError::Quality("too dense".into()))
        } else {
            Ok(completed(&request.chunk_id, Vec::new()))
        }
    });
    let summary = harness
        .orchestrator
        .map(Some(&id), MapOptions::default(), &workers(worker.clone()), &no_cancel())
        .await
        .expect("map");
    assert!(summary.sequential_fallback);
    assert_eq!(summary.failed, 10);
    assert_eq!(summary.completed, chunks - 10);

    for (chunk_id, running) in worker.concurrency() {
        if chunk_number(&chunk_id) >= 10 {
            assert_eq!(running, 1, "{chunk_id} ran alongside others");
        }
    }

    let events = harness.orchestrator.store().read_progress(&id).await.expect("progress");
    assert!(events.iter().any(|e| matches!(
        e.kind,
        ProgressKind::FallbackSequential {
            batch_index: 1,
            consecutive_failing_batches: 2
        }
    )));

    // Failed chunks are recorded and reduce still runs.
    let report = harness.orchestrator.reduce(Some(&id)).await.expect("reduce");
    assert_eq!(report.failed_chunks.len(), 10);
}

#[tokio::test]
async fn escalation_stops_at_the_cost_budget() {
    let mut config = test_config();
    config.escalation.max_fraction = 1.0;
    config.escalation.max_cost = 2.0;
    config.escalation.cost_per_chunk = 1.0;
    let harness = Harness::with_large_file(config);
    let (id, chunks) = harness.init_and_chunk().await;

    let standard = ScriptedWorker::new(|_| {
        Err(DispatchError::Quality("needs a stronger model".into()))
    });
    let escalated = ScriptedWorker::succeeding();
    let workers = Workers {
        standard,
        escalated: Some(escalated.clone()),
    };
    let summary = harness
        .orchestrator
        .map(Some(&id), MapOptions { escalate: true }, &workers, &no_cancel())
        .await
        .expect("map");
    assert_eq!(summary.escalated, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, chunks - 2);
    let mut escalated_calls = escalated.calls();
    escalated_calls.sort();
    assert_eq!(escalated_calls, vec!["chunk_00000".to_string(), "chunk_00001".to_string()]);

    let status = harness.orchestrator.status(Some(&id)).await.expect("status");
    assert_eq!(status.escalation.escalated, 2);
    assert_eq!(status.escalation.cost_spent, 2.0);
}

#[tokio::test]
async fn escalation_without_a_worker_is_refused() {
    let harness = Harness::with_large_file(test_config());
    let (id, _) = harness.init_and_chunk().await;
    let err = harness
        .orchestrator
        .map(
            Some(&id),
            MapOptions { escalate: true },
            &workers(ScriptedWorker::succeeding()),
            &no_cancel(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::WorkerUnavailable(_)), "{err:?}");
}

#[tokio::test]
async fn corrupt_checkpoint_is_reported_as_a_parsing_error() {
    let harness = Harness::with_large_file(test_config());
    let (id, _) = harness.init_and_chunk().await;
    harness
        .orchestrator
        .map(Some(&id), MapOptions::default(), &workers(ScriptedWorker::succeeding()), &no_cancel())
        .await
        .expect("map");

    let checkpoint = harness.orchestrator.store().paths(&id).expect("paths").checkpoint();
    std::fs::write(&checkpoint, "{\"schema_version\": ").expect("corrupt checkpoint");

    let err = harness
        .orchestrator
        .resume(Some(&id), MapOptions::default(), &workers(ScriptedWorker::succeeding()), &no_cancel())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Parsing);
    assert!(err.hint().expect("hint").contains("resume"));
}

#[tokio::test]
async fn locked_and_aborted_sessions_refuse_work() {
    let harness = Harness::with_large_file(test_config());
    let (id, _) = harness.init_and_chunk().await;

    {
        let _held = harness.orchestrator.store().lock(&id).expect("lock");
        let err = harness
            .orchestrator
            .map(Some(&id), MapOptions::default(), &workers(ScriptedWorker::succeeding()), &no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Locked(_)), "{err:?}");
    }

    harness.orchestrator.abort(Some(&id)).await.expect("abort");
    let err = harness
        .orchestrator
        .map(Some(&id), MapOptions::default(), &workers(ScriptedWorker::succeeding()), &no_cancel())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Aborted(_)), "{err:?}");
}
