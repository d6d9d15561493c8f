//! Human-readable renderings of command results. With `--json` the same
//! values are printed as JSON instead.

use anyhow::Result;
use chunkwise_aggregator::AggregateReport;
use chunkwise_orchestrator::{
    ChunkSummary, CleanReport, InitSummary, MapSummary, SessionSummary, StatusReport,
};
use chunkwise_sandbox::{EvalOutcome, SearchOutcome};
use serde::Serialize;
use std::io::{self, Write};

pub(crate) fn print_stdout(text: &str) -> Result<()> {
    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout
        .write_all(text.as_bytes())
        .and_then(|_| stdout.write_all(b"\n"))
        .and_then(|_| stdout.flush())
    {
        if err.kind() == io::ErrorKind::BrokenPipe {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

/// Print `value` as JSON, or its human rendering.
pub(crate) fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T) -> String) -> Result<()> {
    if json {
        print_stdout(&serde_json::to_string_pretty(value)?)
    } else {
        print_stdout(human(value).trim_end())
    }
}

pub(crate) fn render_init(summary: &InitSummary) -> String {
    let mut out = format!(
        "session {}: {} files loaded, {} skipped, {} bytes of context\n",
        summary.session_id, summary.files, summary.skipped_files, summary.context_bytes
    );
    if let Some(delta) = &summary.delta {
        out.push_str(&format!("changes since {}: {}\n", delta.base_session, delta.summary()));
    }
    out
}

pub(crate) fn render_chunks(summary: &ChunkSummary) -> String {
    let verb = if summary.reused { "already has" } else { "now has" };
    format!(
        "session {} {verb} {} chunks ({}, size {}, overlap {})",
        summary.session_id, summary.chunks, summary.strategy, summary.size, summary.overlap
    )
}

pub(crate) fn render_map(summary: &MapSummary) -> String {
    let mut out = format!(
        "session {}: {} batches, {} completed, {} failed, {} escalated",
        summary.session_id, summary.batches, summary.completed, summary.failed, summary.escalated
    );
    if summary.sequential_fallback {
        out.push_str("\nrepeated batch failures: dispatch fell back to one chunk at a time");
    }
    if summary.remaining > 0 {
        out.push_str(&format!("\n{} chunks still pending", summary.remaining));
    }
    out
}

pub(crate) fn render_reduce(report: &AggregateReport) -> String {
    format!(
        "session {}: {} findings ({} duplicates folded), {} flagged for review, {} failed chunks\n\
         run `chunkwise export` for the full report",
        report.session_id,
        report.findings.len(),
        report.stats.duplicates_folded,
        report.contradictions.len(),
        report.failed_chunks.len()
    )
}

pub(crate) fn render_eval(outcome: &EvalOutcome) -> String {
    let mut out = String::new();
    if !outcome.output.is_empty() {
        out.push_str(&outcome.output);
        if !outcome.output.ends_with('\n') {
            out.push('\n');
        }
        if outcome.output_truncated {
            out.push_str("[output truncated]\n");
        }
    }
    out.push_str(&outcome.repr);
    out
}

pub(crate) fn render_search(outcome: &SearchOutcome) -> String {
    let mut out = String::new();
    for hit in &outcome.matches {
        out.push_str(&format!("{}: {}\n", hit.line, hit.text));
    }
    out.push_str(&format!(
        "{} matches in {} bytes{}",
        outcome.matches.len(),
        outcome.scanned_bytes,
        if outcome.truncated { " (truncated)" } else { "" }
    ));
    out
}

pub(crate) fn render_status(status: &StatusReport) -> String {
    let mut out = String::new();
    let marker = if status.current { " (current)" } else { "" };
    out.push_str(&format!("session:   {}{marker}\n", status.session_id));
    out.push_str(&format!("query:     {}\n", status.query));
    out.push_str(&format!("root:      {}\n", status.root.display()));
    let phase = if status.aborted {
        format!("{} (aborted)", status.phase)
    } else {
        status.phase.to_string()
    };
    out.push_str(&format!("phase:     {phase}\n"));
    out.push_str(&format!(
        "context:   {} files, {} skipped, {} bytes\n",
        status.files, status.skipped_files, status.context_bytes
    ));
    out.push_str(&format!(
        "chunks:    {} total, {} completed, {} failed, {} pending, {} processing\n",
        status.chunks, status.completed, status.failed, status.pending, status.processing
    ));
    if let Some(batch) = status.last_checkpoint_batch {
        out.push_str(&format!("checkpoint: batch {batch}\n"));
    }
    if status.sequential_fallback {
        out.push_str("dispatch:  sequential fallback\n");
    }
    if status.escalation.escalated > 0 {
        out.push_str(&format!(
            "escalated: {} chunks, cost {:.2}\n",
            status.escalation.escalated, status.escalation.cost_spent
        ));
    }
    if let (Some(base), Some(delta)) = (&status.base_session, &status.delta) {
        out.push_str(&format!("base:      {base} ({delta})\n"));
    }
    out
}

#[allow(clippy::ptr_arg)]
pub(crate) fn render_sessions(sessions: &Vec<SessionSummary>) -> String {
    if sessions.is_empty() {
        return "no sessions".to_string();
    }
    let mut out = String::new();
    for session in sessions {
        let marker = if session.current { "*" } else { " " };
        let aborted = if session.aborted { " aborted" } else { "" };
        out.push_str(&format!(
            "{marker} {}  {:<9}{aborted}  {}/{} chunks  {}\n",
            session.id,
            session.phase.as_str(),
            session.completed + session.failed,
            session.chunks,
            truncate_one_line(&session.query, 60)
        ));
    }
    out
}

pub(crate) fn render_clean(report: &CleanReport) -> String {
    let mut out = format!(
        "removed {} sessions, freed {} bytes",
        report.removed.len(),
        report.freed_bytes
    );
    if !report.skipped_locked.is_empty() {
        out.push_str(&format!(
            "\nskipped (in use): {}",
            report.skipped_locked.join(", ")
        ));
    }
    out
}

fn truncate_one_line(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() <= max_chars {
        return line.to_string();
    }
    let mut out: String = line.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_queries_are_cut_to_one_line() {
        assert_eq!(truncate_one_line("short", 10), "short");
        assert_eq!(truncate_one_line("first\nsecond", 10), "first");
        assert_eq!(truncate_one_line("abcdefghijkl", 5), "abcd…");
    }
}
