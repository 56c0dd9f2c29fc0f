use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

/// A confirmed identification, waiting to be written to its collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Path recorded in the collection (`archive#member` for archive members)
    pub content_path: String,
    /// Title from the signature table
    pub display_label: String,
    /// `"%08X|crc"` or `"<serial>|serial"`
    pub fingerprint_tag: String,
    /// Target collection file name, e.g. `System.lpl`
    pub collection_name: String,
    pub archive_member: Option<String>,
}

/// Append-only buffer of matches for one scan.
///
/// Duplicates are not filtered here; the playlist writer drops entries
/// already present in the destination collection.
#[derive(Debug, Default)]
pub struct ResultAccumulator {
    results: Vec<MatchResult>,
}

impl ResultAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, result: MatchResult) -> Result<()> {
        if self.results.len() == self.results.capacity() {
            let grow = self.results.capacity().max(4);
            self.results
                .try_reserve(grow)
                .map_err(|_| ScanError::AllocationFailed)?;
        }
        self.results.push(result);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MatchResult> {
        self.results.iter()
    }

    /// Remove every result for which `pred` returns true, returning them in order.
    pub fn extract_if<F>(&mut self, mut pred: F) -> Vec<MatchResult>
    where
        F: FnMut(&MatchResult) -> bool,
    {
        let (taken, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.results).into_iter().partition(|r| pred(r));
        self.results = kept;
        taken
    }

    /// Hand every result over, leaving the accumulator empty.
    pub fn drain(&mut self) -> Vec<MatchResult> {
        std::mem::take(&mut self.results)
    }

    /// Release all held results and their storage.
    pub fn clear(&mut self) {
        self.results = Vec::new();
    }
}
