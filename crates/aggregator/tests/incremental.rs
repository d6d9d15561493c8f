use chunkwise_aggregator::{AggregateInput, Aggregator, AggregatorConfig};
use chunkwise_protocol::{ChunkResult, Confidence, DeltaReport, Finding, ResultStatus, SourceLocation};
use pretty_assertions::assert_eq;

fn finding(point: &str, source: &str) -> Finding {
    Finding {
        point: point.to_string(),
        evidence: "see source".to_string(),
        confidence: Confidence::High,
        source: SourceLocation::parse(source),
    }
}

fn completed(chunk_id: &str, findings: Vec<Finding>) -> ChunkResult {
    ChunkResult {
        chunk_id: chunk_id.to_string(),
        status: ResultStatus::Completed,
        findings,
        missing_info: Vec::new(),
        partial_answer: None,
    }
}

fn aggregator() -> Aggregator {
    Aggregator::new(AggregatorConfig::default()).unwrap()
}

#[test]
fn deleted_file_findings_do_not_resurface() {
    let base = vec![completed(
        "c0000",
        vec![
            finding("a.py builds sql with string formatting", "a.py:12"),
            finding("b.py caches tokens forever", "b.py:3"),
        ],
    )];
    let mut delta = DeltaReport::new("base-session");
    delta.deleted.insert("a.py".to_string());
    delta.unchanged.insert("b.py".to_string());

    let current = vec![completed("c0000", Vec::new())];
    let report = aggregator().aggregate(AggregateInput {
        session_id: "incremental",
        query: "security issues",
        results: &current,
        base_results: &base,
        delta: Some(&delta),
    });

    let points: Vec<&str> = report.findings.iter().map(|f| f.finding.point.as_str()).collect();
    assert_eq!(points, vec!["b.py caches tokens forever"]);
    assert!(report.findings[0].from_base);
    assert_eq!(report.stats.ghosts_dropped, 1);
}

#[test]
fn modified_files_prefer_fresh_findings() {
    let base = vec![completed("c0000", vec![finding("parser panics on empty input", "p.rs:4")])];
    let current = vec![completed("c0000", vec![finding("parser returns an error on empty input", "p.rs:4")])];
    let mut delta = DeltaReport::new("base-session");
    delta.modified.insert("p.rs".to_string());

    let report = aggregator().aggregate(AggregateInput {
        session_id: "incremental",
        query: "robustness",
        results: &current,
        base_results: &base,
        delta: Some(&delta),
    });
    assert_eq!(report.findings.len(), 1);
    assert!(!report.findings[0].from_base);
    assert_eq!(report.stats.superseded_dropped, 1);
}

#[test]
fn contradictions_are_flagged_not_resolved() {
    let current = vec![
        completed("c0000", vec![finding("session tokens are rotated after login", "auth.rs:40-60")]),
        completed("c0001", vec![finding("session tokens are not rotated after login", "auth.rs:55")]),
    ];
    let report = aggregator().aggregate(AggregateInput {
        session_id: "s",
        query: "auth review",
        results: &current,
        base_results: &[],
        delta: None,
    });
    assert_eq!(report.findings.len(), 2);
    assert_eq!(report.contradictions.len(), 1);
    assert_eq!(report.contradictions[0].location, "auth.rs:40-60");

    let markdown = report.to_markdown();
    assert!(markdown.starts_with("# auth review\n"));
    assert!(markdown.contains("## Needs review"));
    assert!(markdown.contains("- Findings 1 and 2 disagree about `auth.rs:40-60`"));

    let json: serde_json::Value = serde_json::from_str(&report.to_json_pretty().unwrap()).unwrap();
    assert_eq!(json["findings"][0]["point"], "session tokens are rotated after login");
    assert_eq!(json["findings"][0]["source"]["file"], "auth.rs");
    assert_eq!(json["stats"]["contradictions"], 1);
}
