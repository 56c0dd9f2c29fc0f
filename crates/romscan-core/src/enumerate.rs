use std::path::Path;

use walkdir::{DirEntry, WalkDir};

use crate::candidate::{Candidate, ContainerKind};
use crate::error::{Result, ScanError};
use crate::ScanOptions;

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// Whether a file passes the extension filter.
///
/// Manifests and archives always pass; archive members are filtered
/// individually when the archive is expanded.
pub(crate) fn extension_allowed(path: &Path, kind: ContainerKind, options: &ScanOptions) -> bool {
    if options.file_exts.is_empty()
        || matches!(kind, ContainerKind::Manifest | ContainerKind::Compressed)
    {
        return true;
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    options
        .file_exts
        .iter()
        .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(&ext))
}

/// Collect candidates under `root`, recursively and in alphabetical order.
///
/// A file root yields exactly that file. Unreadable subdirectories are
/// skipped; an unreadable root is an error.
pub fn enumerate(root: &Path, options: &ScanOptions) -> Result<Vec<Candidate>> {
    let meta = std::fs::metadata(root).map_err(|e| ScanError::unreadable(root, e))?;
    if meta.is_file() {
        return Ok(vec![Candidate::new(root.to_path_buf())]);
    }

    let mut candidates = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| options.include_hidden || !is_hidden(e));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let candidate = Candidate::new(entry.into_path());
        if extension_allowed(&candidate.path, candidate.kind, options) {
            candidates.push(candidate);
        }
    }
    Ok(candidates)
}
