use crate::contradiction::Contradiction;
use crate::error::Result;
use chunkwise_protocol::{Confidence, Finding, SourceLocation};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Where else a folded duplicate was reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Occurrence {
    pub chunk_id: String,
    pub source: SourceLocation,
    pub confidence: Confidence,
}

/// A cluster of near-duplicate findings, represented by its most confident
/// (then earliest) member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MergedFinding {
    #[serde(flatten)]
    pub finding: Finding,
    pub chunk_id: String,
    /// Carried over from the base session of an incremental run
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub from_base: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub occurrences: Vec<Occurrence>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PartialAnswer {
    pub chunk_id: String,
    pub answer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AggregateStats {
    pub chunks: usize,
    pub completed: usize,
    pub partial: usize,
    pub failed: usize,
    pub raw_findings: usize,
    pub merged_findings: usize,
    pub duplicates_folded: usize,
    /// Dropped because their file was deleted since the base session
    pub ghosts_dropped: usize,
    /// Base-session findings dropped because their file changed
    pub superseded_dropped: usize,
    pub contradictions: usize,
}

/// Final output of the reduce phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AggregateReport {
    pub session_id: String,
    pub query: String,
    pub generated_at_ms: u64,
    pub findings: Vec<MergedFinding>,
    pub contradictions: Vec<Contradiction>,
    pub missing_info: Vec<String>,
    pub partial_answers: Vec<PartialAnswer>,
    pub failed_chunks: Vec<String>,
    pub stats: AggregateStats,
}

impl AggregateReport {
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# {}", self.query.trim());
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Session `{}`: {} chunks ({} completed, {} partial, {} failed), {} findings.",
            self.session_id,
            self.stats.chunks,
            self.stats.completed,
            self.stats.partial,
            self.stats.failed,
            self.findings.len()
        );

        if !self.findings.is_empty() {
            let _ = writeln!(out, "\n## Findings\n");
            for (index, merged) in self.findings.iter().enumerate() {
                let finding = &merged.finding;
                let _ = writeln!(
                    out,
                    "{}. **{}** ({}, `{}`)",
                    index + 1,
                    finding.point.trim(),
                    finding.confidence.as_str(),
                    finding.source.label()
                );
                if !finding.evidence.trim().is_empty() {
                    let _ = writeln!(out, "   > {}", finding.evidence.trim().replace('\n', "\n   > "));
                }
                if !merged.occurrences.is_empty() {
                    let also: Vec<String> = merged.occurrences.iter().map(|o| o.source.label()).collect();
                    let _ = writeln!(out, "   Also reported at: {}", also.join(", "));
                }
            }
        }

        if !self.contradictions.is_empty() {
            let _ = writeln!(out, "\n## Needs review\n");
            for flag in &self.contradictions {
                let _ = writeln!(
                    out,
                    "- Findings {} and {} disagree about `{}`",
                    flag.first + 1,
                    flag.second + 1,
                    flag.location
                );
            }
        }

        if !self.partial_answers.is_empty() {
            let _ = writeln!(out, "\n## Partial answers\n");
            for partial in &self.partial_answers {
                let _ = writeln!(out, "- `{}`: {}", partial.chunk_id, partial.answer.trim());
            }
        }

        if !self.missing_info.is_empty() {
            let _ = writeln!(out, "\n## Missing information\n");
            for note in &self.missing_info {
                let _ = writeln!(out, "- {note}");
            }
        }

        if !self.failed_chunks.is_empty() {
            let _ = writeln!(out, "\n## Failed chunks\n");
            let _ = writeln!(out, "{}", self.failed_chunks.join(", "));
        }
        out
    }
}
