//! Builds a session's `context.txt` from a directory tree.

use crate::config::ContextLimits;
use crate::error::{OrchestratorError, Result};
use crate::state::FileEntry;
use chunkwise_chunker::render_section_header;
use chunkwise_protocol::path_filters::{normalize_path, PathFilter};
use chunkwise_protocol::DeltaReport;
use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Bytes inspected for NUL when deciding whether a file is binary.
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// A readable text file found by the scan.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: String,
    pub sha256: String,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct Scan {
    /// Sorted by path
    pub files: Vec<ScannedFile>,
    /// Binary, oversize, unreadable or non-UTF-8 files left out
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct LoadedContext {
    pub text: String,
    pub manifest: Vec<FileEntry>,
    pub skipped: usize,
}

/// Walk `root` the way git sees it and read every text file `filter` allows.
pub fn scan(root: &Path, filter: &PathFilter, limits: &ContextLimits) -> Result<Scan> {
    let meta = std::fs::metadata(root).map_err(|e| OrchestratorError::io(root, e))?;
    if meta.is_file() {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut scan = Scan::default();
        match read_text_file(root, limits)? {
            Some(text) => scan.files.push(scanned(name, text)),
            None => scan.skipped += 1,
        }
        return Ok(scan);
    }

    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(!limits.include_hidden)
        .git_ignore(limits.respect_gitignore)
        .git_global(limits.respect_gitignore)
        .git_exclude(limits.respect_gitignore)
        .ignore(limits.respect_gitignore)
        .require_git(false)
        .sort_by_file_path(|a, b| a.cmp(b));

    let mut files = BTreeMap::new();
    let mut skipped = 0usize;
    let mut total_bytes = 0u64;
    for entry in builder.build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("failed to read entry: {err}");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let Some(rel) = relative_path(root, entry.path()) else {
            continue;
        };
        if !filter.allows(&rel) {
            continue;
        }
        let Some(text) = read_text_file(entry.path(), limits)? else {
            skipped += 1;
            continue;
        };
        total_bytes += text.len() as u64;
        if total_bytes > limits.max_context_bytes {
            return Err(OrchestratorError::LimitExceeded(format!(
                "context exceeds max_context_bytes ({})",
                limits.max_context_bytes
            )));
        }
        files.insert(rel.clone(), scanned(rel, text));
    }

    log::info!("scanned {} files under {} ({skipped} skipped)", files.len(), root.display());
    Ok(Scan {
        files: files.into_values().collect(),
        skipped,
    })
}

/// Concatenate `files` into one document, each file under a
/// `### File: <path>` header.
pub fn build_context<'a>(files: impl IntoIterator<Item = &'a ScannedFile>) -> LoadedContext {
    let mut text = String::new();
    let mut manifest = Vec::new();
    for file in files {
        text.push_str(&render_section_header(&file.path));
        let start = text.len();
        text.push_str(&file.text);
        let end = text.len();
        if !file.text.is_empty() && !file.text.ends_with('\n') {
            text.push('\n');
        }
        manifest.push(FileEntry {
            path: file.path.clone(),
            sha256: file.sha256.clone(),
            bytes: file.text.len() as u64,
            lines: file.text.lines().count(),
            start,
            end,
        });
    }
    LoadedContext {
        text,
        manifest,
        skipped: 0,
    }
}

/// Compare a fresh scan with the manifest of `base_session`.
pub fn compute_delta(base_session: &str, base: &[FileEntry], current: &[ScannedFile]) -> DeltaReport {
    let before: BTreeMap<&str, &str> = base
        .iter()
        .map(|f| (f.path.as_str(), f.sha256.as_str()))
        .collect();
    let mut delta = DeltaReport::new(base_session);
    let mut seen = BTreeSet::new();
    for file in current {
        seen.insert(file.path.as_str());
        match before.get(file.path.as_str()) {
            None => delta.added.insert(file.path.clone()),
            Some(hash) if *hash != file.sha256 => delta.modified.insert(file.path.clone()),
            Some(_) => delta.unchanged.insert(file.path.clone()),
        };
    }
    for path in before.keys().filter(|p| !seen.contains(*p)) {
        delta.deleted.insert((*path).to_string());
    }
    delta
}

/// Load everything under `root`, or with `base` only the files added or
/// modified since that session.
pub fn load(
    root: &Path,
    filter: &PathFilter,
    limits: &ContextLimits,
    base: Option<(&str, &[FileEntry])>,
) -> Result<(LoadedContext, Option<DeltaReport>)> {
    let scan = scan(root, filter, limits)?;
    let (mut context, delta) = match base {
        None => (build_context(&scan.files), None),
        Some((base_id, manifest)) => {
            let delta = compute_delta(base_id, manifest, &scan.files);
            log::info!("delta against {base_id}: {}", delta.summary());
            let changed = scan
                .files
                .iter()
                .filter(|f| delta.added.contains(&f.path) || delta.modified.contains(&f.path));
            (build_context(changed), Some(delta))
        }
    };
    context.skipped = scan.skipped;
    Ok((context, delta))
}

fn scanned(path: String, text: String) -> ScannedFile {
    ScannedFile {
        sha256: sha256_hex(text.as_bytes()),
        path,
        text,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let rel = normalize_path(&rel.to_string_lossy());
    (!rel.is_empty()).then_some(rel)
}

/// `Ok(None)` for files that should be skipped rather than fail the scan.
fn read_text_file(path: &Path, limits: &ContextLimits) -> Result<Option<String>> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) => {
            log::debug!("skipping unreadable {}: {err}", path.display());
            return Ok(None);
        }
    };
    if meta.len() > limits.max_file_bytes {
        log::debug!(
            "skipping large file {} ({} bytes > {})",
            path.display(),
            meta.len(),
            limits.max_file_bytes
        );
        return Ok(None);
    }
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            log::debug!("skipping unreadable {}: {err}", path.display());
            return Ok(None);
        }
        Err(err) => return Err(OrchestratorError::io(PathBuf::from(path), err)),
    };
    if bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0) {
        log::debug!("skipping binary file {}", path.display());
        return Ok(None);
    }
    match String::from_utf8(bytes) {
        Ok(text) => Ok(Some(text)),
        Err(_) => {
            log::debug!("skipping non-UTF-8 file {}", path.display());
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkwise_chunker::parse_sections;
    use pretty_assertions::assert_eq;

    fn write(root: &Path, rel: &str, contents: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn scan_skips_ignored_binary_and_large_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, ".gitignore", b"target/\n");
        write(root, "src/lib.rs", b"pub fn a() {}\n");
        write(root, "target/out.rs", b"generated\n");
        write(root, "logo.png", b"\x89PNG\x00\x00");
        write(root, "big.txt", &vec![b'a'; 64]);

        let limits = ContextLimits {
            max_file_bytes: 32,
            ..ContextLimits::default()
        };
        let scan = scan(root, &PathFilter::default(), &limits).unwrap();
        let paths: Vec<&str> = scan.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/lib.rs"]);
        assert_eq!(scan.skipped, 2);
    }

    #[test]
    fn manifest_ranges_point_at_file_bodies() {
        let files = vec![
            scanned("a.py".into(), "import os\nprint(1)".into()),
            scanned("b.rs".into(), "fn b() {}\n".into()),
        ];
        let context = build_context(&files);
        let sections = parse_sections(&context.text);
        assert_eq!(sections.len(), 2);
        let a = &context.manifest[0];
        assert_eq!(&context.text[a.start..a.end], "import os\nprint(1)");
        assert_eq!(a.lines, 2);
        assert_eq!(sections[1].path, "b.rs");
        assert_eq!(&context.text[context.manifest[1].start..context.manifest[1].end], "fn b() {}\n");
    }

    #[test]
    fn delta_classifies_every_path() {
        let base = build_context(&[
            scanned("a.py".into(), "old".into()),
            scanned("b.py".into(), "same".into()),
            scanned("c.py".into(), "v1".into()),
        ])
        .manifest;
        let now = vec![
            scanned("b.py".into(), "same".into()),
            scanned("c.py".into(), "v2".into()),
            scanned("d.py".into(), "new".into()),
        ];
        let delta = compute_delta("base", &base, &now);
        assert!(delta.is_deleted("a.py"));
        assert!(delta.is_modified("c.py"));
        assert!(delta.added.contains("d.py"));
        assert!(delta.unchanged.contains("b.py"));
    }

    #[test]
    fn incremental_load_only_includes_changed_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "keep.py", b"x = 1\n");
        write(root, "edit.py", b"y = 1\n");
        let (first, _) = load(root, &PathFilter::default(), &ContextLimits::default(), None).unwrap();

        write(root, "edit.py", b"y = 2\n");
        let (second, delta) = load(
            root,
            &PathFilter::default(),
            &ContextLimits::default(),
            Some(("base", first.manifest.as_slice())),
        )
        .unwrap();
        let delta = delta.unwrap();
        assert!(delta.is_modified("edit.py"));
        let paths: Vec<&str> = second.manifest.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["edit.py"]);
    }
}
