mod support;

use chunkwise_orchestrator::{
    CancellationManager, InitOptions, MapOptions, OrchestratorConfig, OrchestratorError, Phase,
};
use chunkwise_sandbox::SearchOptions;
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::sync::Arc;
use support::{completed, finding, test_config, workers, write_file, Harness, ScriptedWorker};

const POINTS: [(&str, &str); 3] = [
    ("a.py", "a.py builds sql queries with string formatting"),
    ("b.py", "b.py caches session tokens forever"),
    ("c.py", "c.py retries requests without any backoff"),
];

/// Reports one finding for every known file whose section is in the chunk.
fn file_aware_worker() -> Arc<ScriptedWorker> {
    ScriptedWorker::new(|request| {
        let findings = POINTS
            .iter()
            .filter(|(path, _)| request.text.contains(&format!("### File: {path}")))
            .map(|(path, point)| finding(point, &format!("{path}:1")))
            .collect();
        Ok(completed(&request.chunk_id, findings))
    })
}

fn roomy_config() -> OrchestratorConfig {
    let mut config = test_config();
    config.chunking.size = 4_096;
    config
}

async fn run_to_report(harness: &Harness, options: InitOptions) -> (String, BTreeSet<String>, usize) {
    let summary = harness.orchestrator.init(options).await.expect("init");
    let id = summary.session_id;
    harness.orchestrator.chunk(Some(&id)).await.expect("chunk");
    harness
        .orchestrator
        .map(
            Some(&id),
            MapOptions::default(),
            &workers(file_aware_worker()),
            &CancellationManager::default(),
        )
        .await
        .expect("map");
    let report = harness.orchestrator.reduce(Some(&id)).await.expect("reduce");
    let points = report.findings.iter().map(|f| f.finding.point.clone()).collect();
    (id, points, report.stats.ghosts_dropped)
}

fn options(harness: &Harness, base: Option<&str>) -> InitOptions {
    InitOptions {
        root: harness.project.path().to_path_buf(),
        query: "security issues".to_string(),
        incremental_from: base.map(str::to_string),
        ..InitOptions::default()
    }
}

#[tokio::test]
async fn incremental_run_drops_findings_about_deleted_files() {
    let harness = Harness::new(roomy_config());
    let root = harness.project.path();
    write_file(root, "a.py", "query = 'select * from t where id=%s' % user_id\n");
    write_file(root, "b.py", "TOKENS = {}\n");
    let (base, points, _) = run_to_report(&harness, options(&harness, None)).await;
    assert_eq!(points.len(), 2);

    std::fs::remove_file(root.join("a.py")).expect("delete a.py");
    write_file(root, "c.py", "while True:\n    fetch()\n");
    let (_, points, ghosts) = run_to_report(&harness, options(&harness, Some(&base))).await;

    let expected: BTreeSet<String> = [POINTS[1].1, POINTS[2].1].iter().map(|p| p.to_string()).collect();
    assert_eq!(points, expected);
    assert_eq!(ghosts, 1);
}

#[tokio::test]
async fn deletion_only_incremental_run_needs_no_chunks() {
    let harness = Harness::new(roomy_config());
    let root = harness.project.path();
    write_file(root, "a.py", "import os\n");
    write_file(root, "b.py", "TOKENS = {}\n");
    let (base, _, _) = run_to_report(&harness, options(&harness, None)).await;

    std::fs::remove_file(root.join("a.py")).expect("delete a.py");
    let summary = harness
        .orchestrator
        .init(options(&harness, Some(&base)))
        .await
        .expect("incremental init");
    let delta = summary.delta.expect("delta");
    assert!(delta.is_deleted("a.py"));
    assert_eq!(summary.context_bytes, 0);

    let id = summary.session_id;
    let chunked = harness.orchestrator.chunk(Some(&id)).await.expect("chunk");
    assert_eq!(chunked.chunks, 0);
    let worker = file_aware_worker();
    harness
        .orchestrator
        .map(Some(&id), MapOptions::default(), &workers(worker.clone()), &CancellationManager::default())
        .await
        .expect("map");
    assert!(worker.calls().is_empty());

    let report = harness.orchestrator.reduce(Some(&id)).await.expect("reduce");
    let points: Vec<&str> = report.findings.iter().map(|f| f.finding.point.as_str()).collect();
    assert_eq!(points, vec![POINTS[1].1]);
    assert!(report.findings[0].from_base);
}

#[tokio::test]
async fn unchanged_tree_has_nothing_to_analyze() {
    let harness = Harness::new(roomy_config());
    write_file(harness.project.path(), "b.py", "TOKENS = {}\n");
    let (base, _, _) = run_to_report(&harness, options(&harness, None)).await;

    let err = harness
        .orchestrator
        .init(options(&harness, Some(&base)))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::EmptyContext(_)), "{err:?}");
}

#[tokio::test]
async fn exploration_enters_scouting_and_survives_rejections() {
    let harness = Harness::with_large_file(test_config());
    let id = harness.init("where does the fox go?").await;

    let outcome = harness
        .orchestrator
        .eval(Some(&id), "len(context) > 0")
        .await
        .expect("eval");
    assert_eq!(outcome.repr, "True");
    let status = harness.orchestrator.status(Some(&id)).await.expect("status");
    assert_eq!(status.phase, Phase::Scouting);

    let err = harness
        .orchestrator
        .eval(Some(&id), "import os\nos.listdir('.')")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Sandbox(_)), "{err:?}");
    let status = harness.orchestrator.status(Some(&id)).await.expect("status");
    assert_eq!(status.phase, Phase::Scouting);
    assert!(!status.aborted);

    let hits = harness
        .orchestrator
        .search(Some(&id), "fox", None, &SearchOptions::default())
        .await
        .expect("search");
    assert_eq!(hits.matches.len(), 20);
    assert_eq!(hits.matches[0].line, 2);

    harness.orchestrator.chunk(Some(&id)).await.expect("chunk after scouting");
}

#[tokio::test]
async fn sessions_can_be_listed_switched_and_removed() {
    let harness = Harness::with_large_file(test_config());
    let err = harness.orchestrator.status(None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NoCurrentSession), "{err:?}");

    let first = harness.init("first question").await;
    let second = harness.init("second question").await;
    assert_eq!(harness.orchestrator.resolve(None).await.expect("current"), second);

    let listed = harness.orchestrator.list().await.expect("list");
    let ids: BTreeSet<&str> = listed.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, BTreeSet::from([first.as_str(), second.as_str()]));
    assert!(listed.iter().any(|s| s.id == second && s.current));

    harness.orchestrator.use_session(&first).await.expect("use");
    assert_eq!(harness.orchestrator.resolve(None).await.expect("current"), first);

    let cleaned = harness.orchestrator.clean(Some(&second)).await.expect("clean");
    assert_eq!(cleaned.removed, vec![second.clone()]);
    assert_eq!(harness.orchestrator.list().await.expect("list").len(), 1);
    let err = harness.orchestrator.status(Some(&second)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::SessionNotFound(_)), "{err:?}");

    harness.orchestrator.abort(None).await.expect("abort");
    let err = harness.orchestrator.chunk(None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Aborted(_)), "{err:?}");
}
