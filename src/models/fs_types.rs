use serde::Serialize;
use std::path::PathBuf;

/// A file surfaced by the scan or the watcher whose extension passed the filter.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub name: String,
    pub extension: String,
    pub path: PathBuf,
}

impl DiscoveredFile {
    /// Builds the record from an absolute path. Returns `None` for paths
    /// without a file name.
    pub fn from_path(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_string();
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_string())
            .unwrap_or_default();
        Some(Self {
            name,
            extension,
            path,
        })
    }
}

#[derive(Debug, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub matched: usize,
    pub skipped: usize,
    pub errors: usize,
}
