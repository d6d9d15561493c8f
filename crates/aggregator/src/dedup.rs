//! Near-duplicate detection over claim token sets.
//!
//! Candidate pairs come from prefix filtering: tokens are ordered rarest
//! first across the whole collection, and two sets can only reach Jaccard
//! `t` if their prefixes of length `|x| - ceil(t * |x|) + 1` share a token.
//! Every candidate is then verified exactly, so the filter never loses a
//! true duplicate.

use std::collections::{BTreeSet, HashMap, HashSet};

/// Tolerance for the `>=` threshold comparison on ratios of small integers.
const EPSILON: f64 = 1e-9;

/// Index pairs `(i, j)` with `i < j` whose Jaccard similarity is at least
/// `threshold`. Empty sets are never duplicates of anything.
pub fn similar_pairs(sets: &[BTreeSet<String>], threshold: f64) -> Vec<(usize, usize)> {
    let mut frequency: HashMap<&str, usize> = HashMap::new();
    for set in sets {
        for token in set {
            *frequency.entry(token.as_str()).or_default() += 1;
        }
    }

    // Rarest first; ties broken by the token itself for a total order.
    let ordered: Vec<Vec<&str>> = sets
        .iter()
        .map(|set| {
            let mut tokens: Vec<&str> = set.iter().map(String::as_str).collect();
            tokens.sort_by(|a, b| frequency[a].cmp(&frequency[b]).then_with(|| a.cmp(b)));
            tokens
        })
        .collect();

    let mut index: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut pairs = Vec::new();
    for (i, tokens) in ordered.iter().enumerate() {
        if tokens.is_empty() {
            continue;
        }
        let required = ((threshold - EPSILON) * tokens.len() as f64).ceil().max(1.0) as usize;
        let prefix = tokens.len().saturating_sub(required) + 1;

        let mut candidates = HashSet::new();
        for token in &tokens[..prefix.min(tokens.len())] {
            if let Some(seen) = index.get(token) {
                candidates.extend(seen.iter().copied());
            }
        }
        let mut candidates: Vec<usize> = candidates.into_iter().collect();
        candidates.sort_unstable();
        for j in candidates {
            if is_similar(&sets[j], &sets[i], threshold) {
                pairs.push((j, i));
            }
        }
        for token in &tokens[..prefix.min(tokens.len())] {
            index.entry(*token).or_default().push(i);
        }
    }
    pairs.sort_unstable();
    pairs
}

pub fn is_similar(a: &BTreeSet<String>, b: &BTreeSet<String>, threshold: f64) -> bool {
    crate::tokens::jaccard(a, b) + EPSILON >= threshold
}

/// Disjoint-set forest used to turn duplicate pairs into clusters.
pub(crate) struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    pub(crate) fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    pub(crate) fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Keep the smaller index as root so clusters list in input order.
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[child] = root;
        }
    }

    /// Clusters in order of their first member.
    pub(crate) fn clusters(mut self) -> Vec<Vec<usize>> {
        let mut by_root: HashMap<usize, usize> = HashMap::new();
        let mut out: Vec<Vec<usize>> = Vec::new();
        for i in 0..self.parent.len() {
            let root = self.find(i);
            let slot = *by_root.entry(root).or_insert_with(|| {
                out.push(Vec::new());
                out.len() - 1
            });
            out[slot].push(i);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::word_set;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn sets(claims: &[&str]) -> Vec<BTreeSet<String>> {
        claims.iter().map(|c| word_set(c)).collect()
    }

    #[test]
    fn threshold_is_inclusive() {
        // 7 shared of 10 distinct tokens: exactly 0.7.
        let at = sets(&["a b c d e f g h i j", "a b c d e f g"]);
        assert_eq!(similar_pairs(&at, 0.7), vec![(0, 1)]);

        // 7 shared of 11 distinct tokens: just below.
        let below = sets(&["a b c d e f g h i j", "a b c d e f g x"]);
        assert!(similar_pairs(&below, 0.7).is_empty());
    }

    #[test]
    fn empty_claims_never_match() {
        assert!(similar_pairs(&sets(&["", "", "..."]), 0.7).is_empty());
    }

    #[test]
    fn clusters_follow_transitive_pairs() {
        let mut uf = UnionFind::new(5);
        uf.union(3, 1);
        uf.union(1, 4);
        assert_eq!(uf.clusters(), vec![vec![0], vec![1, 3, 4], vec![2]]);
    }

    fn brute_force(sets: &[BTreeSet<String>], threshold: f64) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for i in 0..sets.len() {
            for j in i + 1..sets.len() {
                if !sets[i].is_empty() && !sets[j].is_empty() && is_similar(&sets[i], &sets[j], threshold) {
                    pairs.push((i, j));
                }
            }
        }
        pairs
    }

    proptest! {
        #[test]
        fn prefix_filter_matches_all_pairs(
            claims in prop::collection::vec(prop::collection::btree_set("[a-f]", 0..7), 0..14),
            threshold in prop::sample::select(vec![0.3, 0.5, 0.7, 0.9, 1.0]),
        ) {
            let sets: Vec<BTreeSet<String>> = claims;
            prop_assert_eq!(similar_pairs(&sets, threshold), brute_force(&sets, threshold));
        }
    }
}
