use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::accumulator::MatchResult;
use crate::error::{Result, ScanError};

const COLLECTION_VERSION: &str = "1.5";

/// Core hint written for new entries: let the frontend pick a core.
pub const DETECT_CORE: &str = "DETECT";

/// One row of a persisted collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub path: String,
    pub label: String,
    #[serde(default)]
    pub core_path: String,
    #[serde(default)]
    pub core_name: String,
    /// Fingerprint tag, `"%08X|crc"` or `"<serial>|serial"`
    #[serde(default)]
    pub crc32: String,
    #[serde(default)]
    pub db_name: String,
}

impl From<MatchResult> for CollectionEntry {
    fn from(result: MatchResult) -> Self {
        Self {
            path: result.content_path,
            label: result.display_label,
            core_path: DETECT_CORE.to_string(),
            core_name: DETECT_CORE.to_string(),
            crc32: result.fingerprint_tag,
            db_name: result.collection_name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionFile {
    version: String,
    #[serde(default)]
    default_core_path: String,
    #[serde(default)]
    default_core_name: String,
    #[serde(default)]
    items: Vec<CollectionEntry>,
}

impl Default for CollectionFile {
    fn default() -> Self {
        Self {
            version: COLLECTION_VERSION.to_string(),
            default_core_path: String::new(),
            default_core_name: String::new(),
            items: Vec::new(),
        }
    }
}

/// A collection file (`.lpl`) loaded for update.
#[derive(Debug)]
pub struct Collection {
    path: PathBuf,
    file: CollectionFile,
    paths: HashSet<String>,
}

impl Collection {
    /// Load the collection at `path`, or start an empty one if it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let file = if path.exists() {
            let reader = BufReader::new(File::open(path).map_err(|e| ScanError::unreadable(path, e))?);
            serde_json::from_reader(reader)?
        } else {
            CollectionFile::default()
        };
        let paths = file.items.iter().map(|e| e.path.clone()).collect();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            paths,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self, content_path: &str) -> bool {
        self.paths.contains(content_path)
    }

    pub fn append(&mut self, entry: CollectionEntry) {
        self.paths.insert(entry.path.clone());
        self.file.items.push(entry);
    }

    pub fn entries(&self) -> &[CollectionEntry] {
        &self.file.items
    }

    pub fn len(&self) -> usize {
        self.file.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file.items.is_empty()
    }

    /// Order entries by label (case-insensitive), then path.
    pub fn sort(&mut self) {
        self.file.items.sort_by(|a, b| {
            a.label
                .to_lowercase()
                .cmp(&b.label.to_lowercase())
                .then_with(|| a.path.cmp(&b.path))
        });
    }

    /// Write the collection, replacing the previous file atomically.
    pub fn persist(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let temp_path = self.path.with_extension("lpl.tmp");

        // Write to temp file first, then rename
        let file = File::create(&temp_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &self.file)?;

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

/// Outcome of writing accumulated matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub collections_written: usize,
    pub entries_added: usize,
    pub duplicates_skipped: usize,
}

/// Write matches to their collections under `playlist_dir`.
///
/// Results are grouped by collection; each collection is loaded, extended
/// with results whose path it does not already hold, sorted, and persisted
/// once.
pub fn write_results(results: Vec<MatchResult>, playlist_dir: &Path) -> Result<WriteSummary> {
    let mut by_collection: BTreeMap<String, Vec<MatchResult>> = BTreeMap::new();
    for result in results {
        by_collection
            .entry(result.collection_name.clone())
            .or_default()
            .push(result);
    }

    let mut summary = WriteSummary::default();
    for (name, partition) in by_collection {
        let mut collection = Collection::load_or_create(&playlist_dir.join(&name))?;
        let mut added = 0usize;
        for result in partition {
            if collection.exists(&result.content_path) {
                summary.duplicates_skipped += 1;
                continue;
            }
            collection.append(result.into());
            added += 1;
        }
        collection.sort();
        collection.persist()?;

        info!(
            "Wrote {}: {} new entr{}, {} total",
            collection.path().display(),
            added,
            if added == 1 { "y" } else { "ies" },
            collection.len()
        );
        summary.entries_added += added;
        summary.collections_written += 1;
    }
    Ok(summary)
}
