use crate::path_filters::normalize_path;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// File-level difference between an incremental session and its base.
///
/// Paths are stored normalized (see [`normalize_path`]) and sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeltaReport {
    /// Session the scan was compared against
    pub base_session: String,
    pub added: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
    pub unchanged: BTreeSet<String>,
}

impl DeltaReport {
    pub fn new(base_session: impl Into<String>) -> Self {
        Self {
            base_session: base_session.into(),
            ..Self::default()
        }
    }

    pub fn is_deleted(&self, path: &str) -> bool {
        self.deleted.contains(&normalize_path(path))
    }

    pub fn is_modified(&self, path: &str) -> bool {
        self.modified.contains(&normalize_path(path))
    }

    /// Nothing was added, modified or deleted.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} added, {} modified, {} deleted, {} unchanged",
            self.added.len(),
            self.modified.len(),
            self.deleted.len(),
            self.unchanged.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_normalize_paths() {
        let mut delta = DeltaReport::new("s-1");
        delta.deleted.insert("src/a.py".into());
        delta.modified.insert("src/b.py".into());
        assert!(delta.is_deleted("./src/a.py"));
        assert!(!delta.is_deleted("src/b.py"));
        assert!(delta.is_modified("src\\b.py"));
        assert!(!delta.is_empty());
        assert_eq!(delta.summary(), "0 added, 1 modified, 1 deleted, 0 unchanged");
    }
}
