//! Polarity conflicts between findings about the same code.
//!
//! Findings are blocked by location (normalized file path, or the free-form
//! context text), so only findings that could overlap are compared.

use crate::dedup::is_similar;
use crate::tokens::{polarity, word_set};
use chunkwise_protocol::path_filters::normalize_path;
use chunkwise_protocol::SourceLocation;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Two merged findings that appear to disagree. Never resolved
/// automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Contradiction {
    /// Index into the report's finding list
    pub first: usize,
    pub second: usize,
    /// Label of the first finding's location
    pub location: String,
    /// Similarity of the two claims with negation markers removed
    pub similarity: f64,
}

fn block_key(source: &SourceLocation) -> String {
    match source {
        SourceLocation::File { file, .. } => format!("file:{}", normalize_path(file)),
        SourceLocation::Context { context } => format!("context:{}", context.trim().to_lowercase()),
    }
}

/// Flag pairs with overlapping locations where exactly one claim is negated
/// and the remaining words are at least `threshold` similar.
pub fn find_contradictions<'a>(
    findings: impl IntoIterator<Item = (&'a str, &'a SourceLocation)>,
    threshold: f64,
) -> Vec<Contradiction> {
    let mut blocks: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    let mut prepared: Vec<(bool, BTreeSet<String>, &SourceLocation)> = Vec::new();
    for (index, (point, source)) in findings.into_iter().enumerate() {
        let (negated, rest) = polarity(&word_set(point));
        blocks.entry(block_key(source)).or_default().push(index);
        prepared.push((negated, rest, source));
    }

    let mut out = Vec::new();
    for members in blocks.values() {
        for (pos, &i) in members.iter().enumerate() {
            for &j in &members[pos + 1..] {
                let (neg_i, rest_i, src_i) = &prepared[i];
                let (neg_j, rest_j, src_j) = &prepared[j];
                if neg_i == neg_j || !src_i.overlaps(src_j) || rest_i.is_empty() {
                    continue;
                }
                if is_similar(rest_i, rest_j, threshold) {
                    out.push(Contradiction {
                        first: i.min(j),
                        second: i.max(j),
                        location: src_i.label(),
                        similarity: crate::tokens::jaccard(rest_i, rest_j),
                    });
                }
            }
        }
    }
    out.sort_by_key(|c| (c.first, c.second));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn loc(raw: &str) -> SourceLocation {
        SourceLocation::parse(raw)
    }

    #[test]
    fn negated_claim_on_same_lines_is_flagged() {
        let a = loc("src/cache.rs:10-20");
        let b = loc("src/cache.rs:15");
        let found = find_contradictions(
            [
                ("the cache entry is invalidated on write", &a),
                ("the cache entry is never invalidated on write", &b),
            ],
            0.7,
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].first, 0);
        assert_eq!(found[0].second, 1);
        assert_eq!(found[0].location, "src/cache.rs:10-20");
        assert_eq!(found[0].similarity, 1.0);
    }

    #[test]
    fn disjoint_lines_or_same_polarity_are_not_flagged() {
        let a = loc("src/cache.rs:10");
        let b = loc("src/cache.rs:40");
        assert!(find_contradictions(
            [("entry is invalidated", &a), ("entry is not invalidated", &b)],
            0.7
        )
        .is_empty());

        let c = loc("src/cache.rs:10");
        assert!(find_contradictions(
            [("entry is not invalidated", &a), ("entry is not invalidated", &c)],
            0.7
        )
        .is_empty());
    }

    #[test]
    fn dissimilar_remainders_are_not_flagged() {
        let a = loc("src/db.rs");
        assert!(find_contradictions(
            [("uses prepared statements", &a), ("no retry on connection loss", &a)],
            0.7
        )
        .is_empty());
    }
}
