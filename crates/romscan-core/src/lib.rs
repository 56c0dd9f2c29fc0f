pub mod accumulator;
pub mod archive;
pub mod cancel;
pub mod candidate;
pub mod database;
pub mod disc;
pub mod enumerate;
pub mod error;
pub mod fingerprint;
pub mod m3u;
pub mod playlist;
pub mod scan;

use std::cell::Cell;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub use accumulator::{MatchResult, ResultAccumulator};
pub use cancel::CancellationToken;
pub use candidate::{Candidate, ContainerKind};
pub use error::{Result, ScanError};
pub use fingerprint::Fingerprint;
pub use scan::{start_scan, ScanSummary, ScanTask, StepOutcome};

fn default_shared_serial_tables() -> Vec<String> {
    vec![
        "Sony - PlayStation Portable".to_string(),
        "Sony - PlayStation 3".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Directory holding `<Table>.db` signature tables
    pub database_dir: PathBuf,
    /// Directory collections (`<Table>.lpl`) are written to
    pub playlist_dir: PathBuf,
    /// Only search the tables named in `core_tables`
    pub restrict_to_core_tables: bool,
    pub core_tables: Vec<String>,
    /// Match an archive's own checksum before expanding its members
    pub archive_as_candidate: bool,
    /// Stop searching after the first match anywhere in the scan
    pub first_match_only: bool,
    /// Extensions to consider (without dot); empty means all files
    pub file_exts: Vec<String>,
    /// Tables whose serial hits must be confirmed by checksum
    pub serial_shared_tables: Vec<String>,
    pub include_hidden: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            database_dir: PathBuf::from("database"),
            playlist_dir: PathBuf::from("playlists"),
            restrict_to_core_tables: false,
            core_tables: Vec::new(),
            archive_as_candidate: true,
            first_match_only: false,
            file_exts: Vec::new(),
            serial_shared_tables: default_shared_serial_tables(),
            include_hidden: false,
        }
    }
}

impl ScanOptions {
    /// Load options from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| ScanError::unreadable(path, e))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

/// Type alias for progress callback
pub type ProgressCallback = dyn Fn(&str, u64, u64, &str);

/// Throttled progress reporter: emits at most every 200ms or on completion.
pub struct ThrottledProgress<'a> {
    inner: &'a (dyn Fn(&str, u64, u64, &str) + 'a),
    last_emit: Cell<Instant>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a (dyn Fn(&str, u64, u64, &str) + 'a)) -> Self {
        let start = Instant::now();
        Self {
            inner,
            last_emit: Cell::new(start.checked_sub(Duration::from_secs(1)).unwrap_or(start)),
        }
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let is_done = current >= total;
        if !is_done {
            if self.last_emit.get().elapsed().as_millis() < 200 {
                return;
            }
            self.last_emit.set(Instant::now());
        }
        (self.inner)(stage, current, total, message);
    }
}

/// Drive a scan to completion, reporting progress as a percentage.
///
/// This is the scheduler loop for callers without their own task runner.
pub fn run_scan(task: &mut ScanTask, progress_callback: &ProgressCallback) -> Result<ScanSummary> {
    let tp = ThrottledProgress::new(progress_callback);
    loop {
        match task.step() {
            StepOutcome::Continue => {}
            StepOutcome::Progress(pct) => tp.report("scan", pct as u64, 100, task.status()),
            StepOutcome::Done(summary) => {
                tp.report("scan", 100, 100, task.status());
                return Ok(summary);
            }
            StepOutcome::Failed(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::tempdir;

    #[test]
    fn test_options_from_json_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(&path, r#"{"first_match_only": true, "file_exts": ["cue", "bin"]}"#).unwrap();

        let options = ScanOptions::from_json_file(&path).unwrap();
        assert!(options.first_match_only);
        assert!(options.archive_as_candidate);
        assert_eq!(options.file_exts, vec!["cue", "bin"]);
        assert_eq!(options.serial_shared_tables.len(), 2);
    }

    #[test]
    fn test_throttled_progress_always_reports_completion() {
        let calls = RefCell::new(Vec::new());
        let cb = |_: &str, current: u64, _: u64, _: &str| calls.borrow_mut().push(current);
        let tp = ThrottledProgress::new(&cb);
        tp.report("scan", 1, 100, "");
        tp.report("scan", 2, 100, "");
        tp.report("scan", 100, 100, "");
        assert_eq!(*calls.borrow(), vec![1, 100]);
    }
}
