use crate::error::AppError;
use crate::models::fs_types::{DiscoveredFile, ScanSummary};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use walkdir::WalkDir;

pub const DEFAULT_EXTENSIONS: &[&str] = &["jpg"];

/// Set of accepted file extensions. Matching is case-sensitive and exact;
/// an empty set accepts every file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionFilter {
    extensions: HashSet<String>,
}

impl ExtensionFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim_start_matches('.').to_string())
            .filter(|ext| !ext.is_empty())
            .collect();
        Self { extensions }
    }

    pub fn matches(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.contains(ext))
            .unwrap_or(false)
    }
}

/// Remembers which (path, modification time) pairs were already emitted so
/// a file seen by both the scan and the watcher is forwarded once.
#[derive(Debug, Default)]
pub struct SeenFiles {
    seen: Mutex<HashMap<PathBuf, Option<SystemTime>>>,
}

impl SeenFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time a file is offered, and again only if its
    /// modification time changed since.
    pub fn first_sighting(&self, file: &DiscoveredFile) -> bool {
        let modified = std::fs::metadata(&file.path)
            .and_then(|m| m.modified())
            .ok();
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        match seen.get(&file.path) {
            Some(previous) if *previous == modified => false,
            _ => {
                seen.insert(file.path.clone(), modified);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Makes `path` absolute without resolving symlinks.
pub fn absolute_root(path: &Path) -> Result<PathBuf, AppError> {
    if !path.exists() {
        return Err(format!("Path does not exist: {}", path.display()).into());
    }
    if !path.is_dir() {
        return Err(format!("Not a directory: {}", path.display()).into());
    }
    Ok(std::path::absolute(path)?)
}

/// Walks `root` depth-first (pre-order, filesystem order) and calls `on_file`
/// for every regular file accepted by `filter`. Unreadable entries are
/// counted and skipped.
pub fn scan<F>(root: &Path, filter: &ExtensionFilter, mut on_file: F) -> Result<ScanSummary, AppError>
where
    F: FnMut(DiscoveredFile),
{
    let root = absolute_root(root)?;
    let mut summary = ScanSummary::default();

    for entry in WalkDir::new(&root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!("Skipping unreadable entry: {}", e);
                summary.errors += 1;
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        if !filter.matches(entry.path()) {
            summary.skipped += 1;
            continue;
        }

        match DiscoveredFile::from_path(entry.into_path()) {
            Some(file) => {
                summary.matched += 1;
                on_file(file);
            }
            None => summary.skipped += 1,
        }
    }

    Ok(summary)
}
