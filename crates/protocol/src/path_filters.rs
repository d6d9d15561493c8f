/// Include/exclude filters applied when a session's context is loaded.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Vec<String>,
    exclude: Vec<String>,
    pattern: Option<String>,
}

impl PathFilter {
    pub fn new(include: &[String], exclude: &[String], pattern: Option<&str>) -> Self {
        let keep = |raw: &String| {
            let normalized = normalize_path(raw);
            (!normalized.is_empty()).then_some(normalized)
        };
        Self {
            include: include.iter().filter_map(keep).collect(),
            exclude: exclude.iter().filter_map(keep).collect(),
            pattern: pattern
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.include.is_empty() || !self.exclude.is_empty() || self.pattern.is_some()
    }

    /// Excludes win over includes; the pattern is a substring unless it
    /// contains glob metacharacters.
    pub fn allows(&self, rel_path: &str) -> bool {
        let rel_path = normalize_path(rel_path);

        if !self.include.is_empty()
            && !self
                .include
                .iter()
                .any(|prefix| is_path_prefix(prefix, &rel_path))
        {
            return false;
        }

        if self
            .exclude
            .iter()
            .any(|prefix| is_path_prefix(prefix, &rel_path))
        {
            return false;
        }

        match self.pattern.as_deref() {
            None => true,
            Some(pattern) if !pattern.contains('*') && !pattern.contains('?') => {
                rel_path.contains(pattern)
            }
            Some(pattern) => glob::Pattern::new(pattern)
                .map(|p| p.matches(&rel_path))
                .unwrap_or(false),
        }
    }
}

/// Canonical relative form used wherever paths are compared: forward slashes,
/// no leading `./`, no leading or trailing `/`.
pub fn normalize_path(raw: &str) -> String {
    let mut value = raw.trim().replace('\\', "/");
    while let Some(rest) = value.strip_prefix("./") {
        value = rest.to_string();
    }
    let value = value.trim_matches('/');
    if value == "." {
        return String::new();
    }
    value.to_string()
}

fn is_path_prefix(prefix: &str, path: &str) -> bool {
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn include_is_a_directory_prefix() {
        let filter = PathFilter::new(&strings(&["src"]), &[], None);
        assert!(filter.allows("src/lib.rs"));
        assert!(!filter.allows("src2/lib.rs"));
        assert!(!filter.allows("docs/README.md"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let filter = PathFilter::new(&strings(&["src"]), &strings(&["src/gen"]), None);
        assert!(filter.allows("src/lib.rs"));
        assert!(!filter.allows("src/gen/mod.rs"));
    }

    #[test]
    fn pattern_is_substring_or_glob() {
        let substring = PathFilter::new(&[], &[], Some("lib.rs"));
        assert!(substring.allows("src/lib.rs"));
        assert!(!substring.allows("src/main.rs"));

        let glob = PathFilter::new(&[], &[], Some("src/*.rs"));
        assert!(glob.allows("src/lib.rs"));
        assert!(!glob.allows("src/lib.ts"));
    }

    #[test]
    fn degenerate_prefixes_do_not_activate() {
        let filter = PathFilter::new(&strings(&["", ".", "./", "/"]), &strings(&["////"]), None);
        assert!(!filter.is_active());
        assert!(filter.allows("docs/README.md"));
    }

    #[test]
    fn normalization_strips_dot_slash_and_backslashes() {
        assert_eq!(normalize_path("./src\\a.py"), "src/a.py");
        assert_eq!(normalize_path("/src/a.py/"), "src/a.py");
    }
}
