use crate::contradiction::find_contradictions;
use crate::dedup::{similar_pairs, UnionFind};
use crate::error::{AggregatorError, Result};
use crate::report::{AggregateReport, AggregateStats, MergedFinding, Occurrence, PartialAnswer};
use crate::tokens::{polarity, word_set};
use chunkwise_protocol::{unix_now_ms, ChunkResult, DeltaReport, Finding, ResultStatus};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Claims at or above this Jaccard similarity are folded together
    pub similarity_threshold: f64,
    /// Minimum similarity of negation-stripped claims to flag a contradiction
    pub contradiction_threshold: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            contradiction_threshold: 0.7,
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("similarity_threshold", self.similarity_threshold),
            ("contradiction_threshold", self.contradiction_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(AggregatorError::InvalidConfig(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Everything the reduce phase merges.
#[derive(Debug, Clone, Copy)]
pub struct AggregateInput<'a> {
    pub session_id: &'a str,
    pub query: &'a str,
    /// Results of this session, in chunk order
    pub results: &'a [ChunkResult],
    /// Results of the base session when this run is incremental
    pub base_results: &'a [ChunkResult],
    pub delta: Option<&'a DeltaReport>,
}

struct Candidate<'a> {
    finding: &'a Finding,
    chunk_id: &'a str,
    from_base: bool,
}

pub struct Aggregator {
    config: AggregatorConfig,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn aggregate(&self, input: AggregateInput<'_>) -> AggregateReport {
        let mut stats = AggregateStats {
            chunks: input.results.len(),
            ..AggregateStats::default()
        };
        let mut missing_info = Vec::new();
        let mut seen_notes = BTreeSet::new();
        let mut partial_answers = Vec::new();
        let mut failed_chunks = Vec::new();

        for result in input.results {
            match result.status {
                ResultStatus::Completed => stats.completed += 1,
                ResultStatus::Partial => stats.partial += 1,
                ResultStatus::Failed => {
                    stats.failed += 1;
                    failed_chunks.push(result.chunk_id.clone());
                }
            }
            for note in &result.missing_info {
                let note = note.trim();
                if !note.is_empty() && seen_notes.insert(note.to_lowercase()) {
                    missing_info.push(note.to_string());
                }
            }
            if let Some(answer) = result.partial_answer.as_deref().filter(|a| !a.trim().is_empty()) {
                partial_answers.push(PartialAnswer {
                    chunk_id: result.chunk_id.clone(),
                    answer: answer.to_string(),
                });
            }
        }

        let mut candidates: Vec<Candidate<'_>> = Vec::new();
        let sources = input
            .results
            .iter()
            .map(|r| (r, false))
            .chain(input.base_results.iter().map(|r| (r, true)));
        for (result, from_base) in sources {
            if !result.status.is_usable() {
                continue;
            }
            for finding in &result.findings {
                stats.raw_findings += 1;
                let file = finding.source.file_path();
                if let (Some(delta), Some(file)) = (input.delta, file) {
                    if delta.is_deleted(file) {
                        stats.ghosts_dropped += 1;
                        continue;
                    }
                    if from_base && delta.is_modified(file) {
                        stats.superseded_dropped += 1;
                        continue;
                    }
                }
                candidates.push(Candidate {
                    finding,
                    chunk_id: &result.chunk_id,
                    from_base,
                });
            }
        }

        let findings = self.fold_duplicates(&candidates);
        stats.merged_findings = findings.len();
        stats.duplicates_folded = candidates.len() - findings.len();

        let contradictions = find_contradictions(
            findings.iter().map(|m| (m.finding.point.as_str(), &m.finding.source)),
            self.config.contradiction_threshold,
        );
        stats.contradictions = contradictions.len();

        log::info!(
            "aggregated {} findings into {} ({} duplicates, {} ghosts, {} superseded, {} contradictions)",
            stats.raw_findings,
            stats.merged_findings,
            stats.duplicates_folded,
            stats.ghosts_dropped,
            stats.superseded_dropped,
            stats.contradictions
        );

        AggregateReport {
            session_id: input.session_id.to_string(),
            query: input.query.to_string(),
            generated_at_ms: unix_now_ms(),
            findings,
            contradictions,
            missing_info,
            partial_answers,
            failed_chunks,
            stats,
        }
    }

    fn fold_duplicates(&self, candidates: &[Candidate<'_>]) -> Vec<MergedFinding> {
        let sets: Vec<BTreeSet<String>> = candidates.iter().map(|c| word_set(&c.finding.point)).collect();
        let negated: Vec<bool> = sets.iter().map(|set| polarity(set).0).collect();
        let mut clusters = UnionFind::new(candidates.len());
        for (a, b) in similar_pairs(&sets, self.config.similarity_threshold) {
            // Opposite claims stay apart so the contradiction check sees both.
            if negated[a] == negated[b] {
                clusters.union(a, b);
            }
        }

        clusters
            .clusters()
            .into_iter()
            .filter_map(|members| {
                // Highest confidence wins; `min_by_key` keeps the earliest on ties.
                let representative = *members
                    .iter()
                    .min_by_key(|&&i| std::cmp::Reverse(candidates[i].finding.confidence))?;
                let chosen = &candidates[representative];
                let occurrences = members
                    .iter()
                    .filter(|&&i| i != representative)
                    .map(|&i| Occurrence {
                        chunk_id: candidates[i].chunk_id.to_string(),
                        source: candidates[i].finding.source.clone(),
                        confidence: candidates[i].finding.confidence,
                    })
                    .collect();
                Some(MergedFinding {
                    finding: chosen.finding.clone(),
                    chunk_id: chosen.chunk_id.to_string(),
                    from_base: chosen.from_base,
                    occurrences,
                })
            })
            .collect()
    }
}
