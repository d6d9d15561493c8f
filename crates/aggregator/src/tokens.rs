//! Claim tokenization shared by deduplication and contradiction checks.

use std::collections::BTreeSet;
use unicode_segmentation::UnicodeSegmentation;

/// Words and contractions that flip the polarity of a claim.
pub const NEGATION_MARKERS: &[&str] = &[
    "not", "no", "never", "none", "nothing", "nobody", "neither", "nor", "without", "cannot",
    "can't", "cant", "don't", "dont", "doesn't", "doesnt", "didn't", "isn't", "isnt", "aren't",
    "wasn't", "weren't", "won't", "wouldn't", "shouldn't", "hasn't", "haven't", "lacks", "lacking",
    "missing", "absent",
];

/// Lowercased word tokens of a claim, as a set.
pub fn word_set(text: &str) -> BTreeSet<String> {
    text.unicode_words()
        .map(|word| word.to_lowercase().replace('\u{2019}', "'"))
        .collect()
}

pub fn is_negation(token: &str) -> bool {
    NEGATION_MARKERS.contains(&token)
}

/// Split a token set into (has a negation marker, tokens without markers).
pub fn polarity(tokens: &BTreeSet<String>) -> (bool, BTreeSet<String>) {
    let negated = tokens.iter().any(|t| is_negation(t));
    let rest = tokens.iter().filter(|t| !is_negation(t)).cloned().collect();
    (negated, rest)
}

/// Jaccard coefficient; two empty sets are not similar.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    let union = a.len() + b.len() - shared;
    shared as f64 / union as f64
}
