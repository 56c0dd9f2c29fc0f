//! Resumable, step-wise content scan.
//!
//! A [`ScanTask`] walks each candidate through
//! `Begin → ComputeFingerprint → MatchAgainstTable → (commit | next row | next table)`.
//! Every call to [`ScanTask::step`] performs one bounded unit of work: start a
//! candidate, fingerprint it, read bounds or query one table, or examine one row.
//! Once every candidate is processed, manifests are collapsed and the
//! accumulated matches are written to their collections.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::accumulator::{MatchResult, ResultAccumulator};
use crate::archive::{self, ArchiveMember};
use crate::cancel::CancellationToken;
use crate::candidate::{Candidate, ContainerKind};
use crate::database::{DatabaseIndex, Query, SignatureRow, SignatureStore, SqliteStore};
use crate::disc::{DefaultExtractor, DiscExtractor};
use crate::enumerate;
use crate::error::{Result, ScanError};
use crate::fingerprint::{self, ArchiveSum, Fingerprint};
use crate::m3u;
use crate::playlist::{self, WriteSummary};
use crate::ScanOptions;

/// What one `step()` call achieved.
#[derive(Debug)]
pub enum StepOutcome {
    Continue,
    /// A new candidate was started; overall completion in percent.
    Progress(u8),
    Done(ScanSummary),
    Failed(ScanError),
}

/// Counters reported when a scan finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub candidates_examined: usize,
    pub matched: usize,
    pub unmatched: usize,
    /// Unreadable or malformed candidates
    pub skipped: usize,
    pub archives_expanded: usize,
    pub manifests_collapsed: usize,
    pub write: WriteSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Begin,
    ComputeFingerprint,
    MatchAgainstTable,
    Collapse,
    Write,
    Finished,
    Aborted(String),
}

/// Cursors for the candidate currently being matched.
#[derive(Debug, Default)]
pub struct ScanState {
    /// Position in the table search order
    pub list_index: usize,
    /// Next row to examine in the current table's lookup result
    pub entry_index: usize,
    pub fingerprint: Option<Fingerprint>,
    query: Option<Query>,
    /// Exact-match result set for `query`; small, so fetched whole and walked one row per step.
    rows: Option<Vec<SignatureRow>>,
}

impl ScanState {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn next_table(&mut self) {
        self.list_index += 1;
        self.entry_index = 0;
        self.query = None;
        self.rows = None;
    }
}

/// Handle for one running scan.
pub struct ScanTask {
    options: ScanOptions,
    single_file: bool,
    candidates: VecDeque<Candidate>,
    total: usize,
    current: Option<Candidate>,
    state: ScanState,
    phase: Phase,
    db: DatabaseIndex,
    extractor: Box<dyn DiscExtractor>,
    results: ResultAccumulator,
    manifests: Vec<PathBuf>,
    expanded_archives: HashSet<PathBuf>,
    fingerprints: HashMap<Candidate, Fingerprint>,
    archive_sums: HashMap<PathBuf, ArchiveSum>,
    /// Central-directory entries captured when an archive was expanded.
    archive_members: HashMap<(PathBuf, String), ArchiveMember>,
    committed: HashSet<(String, Option<String>)>,
    cancel: CancellationToken,
    status: String,
    summary: ScanSummary,
}

impl std::fmt::Debug for ScanTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanTask")
            .field("phase", &self.phase)
            .field("remaining", &self.candidates.len())
            .field("status", &self.status)
            .finish()
    }
}

/// Start a scan of `root` against the SQLite tables in `options.database_dir`.
pub fn start_scan(root: &Path, options: ScanOptions) -> Result<ScanTask> {
    let store = SqliteStore::new(&options.database_dir);
    ScanTask::new(root, options, Box::new(store))
}

impl ScanTask {
    /// Enumerate `root` and prepare to match it against `store`.
    pub fn new(root: &Path, options: ScanOptions, store: Box<dyn SignatureStore>) -> Result<Self> {
        let single_file = root.is_file();
        let candidates = enumerate::enumerate(root, &options)?;
        let only = options
            .restrict_to_core_tables
            .then_some(options.core_tables.as_slice());
        let db = DatabaseIndex::new(store, only, &options.serial_shared_tables)?;

        info!(
            "Scanning {} candidate(s) under {} against {} signature table(s)",
            candidates.len(),
            root.display(),
            db.len()
        );

        Ok(Self {
            single_file,
            total: candidates.len(),
            candidates: candidates.into(),
            current: None,
            state: ScanState::default(),
            phase: Phase::Begin,
            db,
            extractor: Box::new(DefaultExtractor),
            results: ResultAccumulator::new(),
            manifests: Vec::new(),
            expanded_archives: HashSet::new(),
            fingerprints: HashMap::new(),
            archive_sums: HashMap::new(),
            archive_members: HashMap::new(),
            committed: HashSet::new(),
            cancel: CancellationToken::new(),
            status: String::new(),
            summary: ScanSummary::default(),
            options,
        })
    }

    /// Replace the disc-image serial extractor.
    pub fn with_extractor(mut self, extractor: Box<dyn DiscExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Use a cancellation token shared with the caller.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation; takes effect at the next `step()`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Human-readable description of the current work.
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Completion in percent, by candidates started.
    pub fn progress(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        let done = self.total - self.candidates.len();
        ((done * 100) / self.total).min(100) as u8
    }

    pub fn summary(&self) -> &ScanSummary {
        &self.summary
    }

    /// Table names in current search order.
    pub fn table_order(&self) -> Vec<&str> {
        self.db.order()
    }

    /// Matches accumulated so far (empty once written).
    pub fn results(&self) -> impl Iterator<Item = &MatchResult> {
        self.results.iter()
    }

    /// Advance the scan by one unit of work.
    pub fn step(&mut self) -> StepOutcome {
        match &self.phase {
            Phase::Finished => return StepOutcome::Done(self.summary.clone()),
            Phase::Aborted(reason) => return StepOutcome::Failed(ScanError::Aborted(reason.clone())),
            _ => {}
        }
        if self.cancel.is_cancelled() {
            info!("Scan cancelled; discarding {} pending match(es)", self.results.len());
            self.abort(&ScanError::Cancelled);
            return StepOutcome::Failed(ScanError::Cancelled);
        }
        if self.cancel.is_paused() {
            return StepOutcome::Continue;
        }

        match self.advance() {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Scan failed: {}", e);
                self.abort(&e);
                StepOutcome::Failed(e)
            }
        }
    }

    /// Drop every scan-scoped resource without writing anything.
    fn abort(&mut self, err: &ScanError) {
        self.candidates.clear();
        self.current = None;
        self.state.reset();
        self.results.clear();
        self.manifests.clear();
        self.fingerprints.clear();
        self.archive_sums.clear();
        self.archive_members.clear();
        self.db.release();
        self.status = err.to_string();
        self.phase = Phase::Aborted(err.to_string());
    }

    fn advance(&mut self) -> Result<StepOutcome> {
        match self.phase {
            Phase::Begin => self.begin_candidate(),
            Phase::ComputeFingerprint => self.compute_fingerprint(),
            Phase::MatchAgainstTable => self.match_step(),
            Phase::Collapse => {
                self.summary.manifests_collapsed = m3u::collapse_all(&self.manifests, &mut self.results)?;
                self.manifests.clear();
                self.status = "Writing collections".to_string();
                self.phase = Phase::Write;
                Ok(StepOutcome::Continue)
            }
            Phase::Write => {
                let results = self.results.drain();
                self.summary.write = playlist::write_results(results, &self.options.playlist_dir)?;
                self.db.release();
                self.phase = Phase::Finished;
                self.status = "Scan complete".to_string();
                info!(
                    "Scan complete: {} examined, {} matched, {} new collection entr(ies)",
                    self.summary.candidates_examined, self.summary.matched, self.summary.write.entries_added
                );
                Ok(StepOutcome::Done(self.summary.clone()))
            }
            Phase::Finished | Phase::Aborted(_) => Ok(StepOutcome::Continue),
        }
    }

    fn begin_candidate(&mut self) -> Result<StepOutcome> {
        if self.options.first_match_only && self.summary.matched > 0 {
            debug!("First match found; skipping {} remaining candidate(s)", self.candidates.len());
            self.candidates.clear();
        }
        let Some(candidate) = self.candidates.pop_front() else {
            self.status = "Collapsing multi-part titles".to_string();
            self.phase = Phase::Collapse;
            return Ok(StepOutcome::Continue);
        };

        self.summary.candidates_examined += 1;
        self.status = format!("Scanning {}", candidate.display_name());
        self.state.reset();

        let key = (candidate.content_path(), candidate.archive_member.clone());
        if self.committed.contains(&key) {
            debug!("{} already matched in this scan", key.0);
        } else if candidate.kind == ContainerKind::Manifest {
            // Resolved once every disc has had its chance to match.
            self.manifests.push(candidate.path);
        } else if candidate.kind == ContainerKind::Compressed
            && candidate.archive_member.is_none()
            && !self.options.archive_as_candidate
        {
            return self.expand_archive(candidate).map(|_| StepOutcome::Progress(self.progress()));
        } else {
            self.current = Some(candidate);
            self.phase = Phase::ComputeFingerprint;
        }
        Ok(StepOutcome::Progress(self.progress()))
    }

    fn archive_sum(&mut self, path: &Path) -> Result<ArchiveSum> {
        if let Some(sum) = self.archive_sums.get(path) {
            return Ok(*sum);
        }
        let sum = fingerprint::archive_sum(path)?;
        self.archive_sums.insert(path.to_path_buf(), sum);
        Ok(sum)
    }

    fn fingerprint_candidate(&mut self, candidate: &Candidate) -> Result<Fingerprint> {
        if let Some(fp) = self.fingerprints.get(candidate) {
            return Ok(fp.clone());
        }
        let fp = if let Some(name) = &candidate.archive_member {
            let key = (candidate.path.clone(), name.clone());
            let member = self.archive_members.get(&key).cloned().ok_or_else(|| {
                ScanError::malformed(&candidate.path, format!("member '{}' was never listed", name))
            })?;
            let outer = self.archive_sum(&candidate.path)?;
            fingerprint::compute_member(candidate, &member, outer)?
        } else {
            let fp = fingerprint::compute(candidate, self.extractor.as_ref())?;
            if candidate.kind == ContainerKind::Compressed {
                if let Some(checksum) = fp.checksum {
                    self.archive_sums.insert(
                        candidate.path.clone(),
                        ArchiveSum {
                            checksum,
                            byte_len: fp.byte_len,
                        },
                    );
                }
            }
            fp
        };
        self.fingerprints.insert(candidate.clone(), fp.clone());
        Ok(fp)
    }

    fn compute_fingerprint(&mut self) -> Result<StepOutcome> {
        let Some(candidate) = self.current.clone() else {
            self.phase = Phase::Begin;
            return Ok(StepOutcome::Continue);
        };
        match self.fingerprint_candidate(&candidate) {
            Ok(fp) => {
                trace!("{} fingerprint {}", candidate.display_name(), fp.tag());
                self.state.fingerprint = Some(fp);
                self.state.list_index = 0;
                self.phase = Phase::MatchAgainstTable;
                Ok(StepOutcome::Continue)
            }
            Err(e) => self.candidate_failed(e),
        }
    }

    /// Abandon the current candidate, or the scan if the error is terminal.
    fn candidate_failed(&mut self, err: ScanError) -> Result<StepOutcome> {
        let terminal = !err.is_candidate_local()
            || (self.single_file && matches!(err, ScanError::MalformedContainer { .. }));
        if terminal {
            return Err(err);
        }
        match err {
            ScanError::MalformedContainer { .. } => warn!("Skipping candidate: {}", err),
            _ => debug!("Skipping candidate: {}", err),
        }
        self.summary.skipped += 1;
        self.finish_candidate();
        Ok(StepOutcome::Continue)
    }

    fn finish_candidate(&mut self) {
        self.current = None;
        self.state.reset();
        self.phase = Phase::Begin;
    }

    fn match_step(&mut self) -> Result<StepOutcome> {
        let Some(fp) = self.state.fingerprint.as_ref() else {
            self.finish_candidate();
            return Ok(StepOutcome::Continue);
        };
        let index = self.state.list_index;
        let Some(table) = self.db.table(index) else {
            return self.tables_exhausted();
        };

        let Some(rows) = self.state.rows.as_ref() else {
            // Read bounds, prune, then query this table.
            if table.unavailable {
                self.state.next_table();
                return Ok(StepOutcome::Continue);
            }
            let bounds = match self.db.bounds(index) {
                Ok(bounds) => bounds,
                Err(_) => {
                    self.state.next_table();
                    return Ok(StepOutcome::Continue);
                }
            };
            if bounds.excludes(fp) {
                trace!("Size bounds exclude table at position {}", index);
                self.state.next_table();
                return Ok(StepOutcome::Continue);
            }
            let Some(query) = Query::for_table(fp, &bounds) else {
                self.state.next_table();
                return Ok(StepOutcome::Continue);
            };
            match self.db.lookup(index, &query) {
                Ok(rows) => {
                    self.state.rows = Some(rows);
                    self.state.query = Some(query);
                    self.state.entry_index = 0;
                }
                Err(_) => self.state.next_table(),
            }
            return Ok(StepOutcome::Continue);
        };

        let Some(row) = rows.get(self.state.entry_index).cloned() else {
            self.state.next_table();
            return Ok(StepOutcome::Continue);
        };
        self.state.entry_index += 1;

        let Some(query) = self.state.query.as_ref() else {
            self.state.next_table();
            return Ok(StepOutcome::Continue);
        };
        if !query.matches(&row) {
            return Ok(StepOutcome::Continue);
        }

        if matches!(query, Query::Serial(_)) && table.shares_serials {
            match self.confirm_serial(index, &row) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Serial hit '{}' not confirmed by checksum", row.name);
                    return Ok(StepOutcome::Continue);
                }
                Err(e) => return self.candidate_failed(e),
            }
        }
        self.commit(index, row)
    }

    /// Confirm a provisional serial hit with a checksum query on the same table.
    fn confirm_serial(&mut self, index: usize, row: &SignatureRow) -> Result<bool> {
        let Some(fp) = self.state.fingerprint.as_mut() else {
            return Ok(false);
        };
        let Some(checksum) = fp.ensure_checksum()? else {
            return Ok(false);
        };
        let query = Query::Checksum {
            checksum,
            archive_checksum: fp.archive_checksum,
        };
        let confirmed = match self.db.lookup(index, &query) {
            Ok(rows) => rows
                .iter()
                .any(|r| query.matches(r) && r.name == row.name),
            Err(_) => false,
        };
        Ok(confirmed)
    }

    fn commit(&mut self, index: usize, row: SignatureRow) -> Result<StepOutcome> {
        let Some(candidate) = self.current.take() else {
            self.finish_candidate();
            return Ok(StepOutcome::Continue);
        };
        let collection_name = match self.db.table(index) {
            Some(table) => table.collection_name(),
            None => return Ok(StepOutcome::Continue),
        };
        let tag = self
            .state
            .fingerprint
            .as_ref()
            .map(Fingerprint::tag)
            .unwrap_or_default();

        let result = MatchResult {
            content_path: candidate.content_path(),
            display_label: row.name,
            fingerprint_tag: tag,
            collection_name,
            archive_member: candidate.archive_member.clone(),
        };
        debug!(
            "Matched {} as '{}' in {}",
            result.content_path, result.display_label, result.collection_name
        );
        self.committed
            .insert((result.content_path.clone(), result.archive_member.clone()));
        self.results.add(result)?;
        self.db.promote(index);
        self.summary.matched += 1;
        self.finish_candidate();
        Ok(StepOutcome::Continue)
    }

    fn tables_exhausted(&mut self) -> Result<StepOutcome> {
        let Some(candidate) = self.current.take() else {
            self.finish_candidate();
            return Ok(StepOutcome::Continue);
        };
        self.finish_candidate();
        if candidate.kind == ContainerKind::Compressed && candidate.archive_member.is_none() {
            return self.expand_archive(candidate);
        }
        debug!("No match for {}", candidate.content_path());
        self.summary.unmatched += 1;
        Ok(StepOutcome::Continue)
    }

    /// Queue an unmatched archive's members as candidates, once per archive.
    fn expand_archive(&mut self, candidate: Candidate) -> Result<StepOutcome> {
        self.phase = Phase::Begin;
        if !self.expanded_archives.insert(candidate.path.clone()) {
            debug!("{} already expanded", candidate.path.display());
            return Ok(StepOutcome::Continue);
        }
        let members = match archive::list_members(&candidate.path) {
            Ok(members) => members,
            Err(e) => return self.candidate_failed(e),
        };

        let before = self.candidates.len();
        for member in members {
            let child = Candidate::archive_member(&candidate.path, member.name.clone());
            if enumerate::extension_allowed(Path::new(&member.name), child.kind, &self.options) {
                self.archive_members
                    .insert((candidate.path.clone(), member.name.clone()), member);
                self.candidates.push_back(child);
            }
        }
        let added = self.candidates.len() - before;
        self.total += added;
        self.summary.archives_expanded += 1;
        debug!("Expanded {} into {} member(s)", candidate.path.display(), added);
        Ok(StepOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::TableBounds;
    use crate::playlist::Collection;
    use std::cell::{Cell, RefCell};
    use std::fs;
    use std::io::Write;
    use std::rc::Rc;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct SpyLog {
        lookups: Vec<String>,
        bounds_reads: Vec<String>,
        releases: usize,
    }

    /// In-memory store that records every bounds read and lookup it serves.
    struct SpyStore {
        tables: Vec<(String, Vec<SignatureRow>)>,
        /// Listed ahead of `tables` but fail every bounds read.
        broken: Vec<String>,
        log: Rc<RefCell<SpyLog>>,
    }

    impl SpyStore {
        fn new(tables: Vec<(&str, Vec<SignatureRow>)>) -> (Self, Rc<RefCell<SpyLog>>) {
            let log = Rc::new(RefCell::new(SpyLog::default()));
            let store = Self {
                tables: tables.into_iter().map(|(n, rows)| (n.to_string(), rows)).collect(),
                broken: Vec::new(),
                log: log.clone(),
            };
            (store, log)
        }

        fn with_broken(mut self, table: &str) -> Self {
            self.broken.push(table.to_string());
            self
        }

        fn rows(&self, table: &str) -> Result<&Vec<SignatureRow>> {
            self.tables
                .iter()
                .find(|(name, _)| name == table)
                .map(|(_, rows)| rows)
                .ok_or_else(|| ScanError::DatabaseUnavailable {
                    table: table.to_string(),
                    reason: "missing".to_string(),
                })
        }

        fn filtered(&mut self, table: &str, query: Query) -> Result<Vec<SignatureRow>> {
            self.log.borrow_mut().lookups.push(table.to_string());
            Ok(self
                .rows(table)?
                .iter()
                .filter(|r| query.matches(r))
                .cloned()
                .collect())
        }
    }

    impl SignatureStore for SpyStore {
        fn table_names(&self) -> Result<Vec<String>> {
            Ok(self
                .broken
                .iter()
                .cloned()
                .chain(self.tables.iter().map(|(name, _)| name.clone()))
                .collect())
        }

        fn read_bounds(&mut self, table: &str) -> Result<TableBounds> {
            self.log.borrow_mut().bounds_reads.push(table.to_string());
            let rows = self.rows(table)?;
            let sizes: Vec<i64> = rows.iter().filter_map(|r| r.size.map(|s| s as i64)).collect();
            Ok(TableBounds {
                size_min: sizes.iter().min().copied(),
                size_max: sizes.iter().max().copied(),
                has_serial: rows.iter().any(|r| r.serial.is_some()),
                has_checksum: rows.iter().any(|r| r.crc.is_some()),
            })
        }

        fn lookup_checksum(
            &mut self,
            table: &str,
            checksum: u32,
            archive_checksum: Option<u32>,
        ) -> Result<Vec<SignatureRow>> {
            self.filtered(
                table,
                Query::Checksum {
                    checksum,
                    archive_checksum,
                },
            )
        }

        fn lookup_serial(&mut self, table: &str, serial: &str) -> Result<Vec<SignatureRow>> {
            self.filtered(table, Query::Serial(serial.to_string()))
        }

        fn release(&mut self) {
            self.log.borrow_mut().releases += 1;
        }
    }

    const ROM: &[u8] = b"NES\x1a rom body";

    fn options(dir: &TempDir) -> ScanOptions {
        ScanOptions {
            playlist_dir: dir.path().join("playlists"),
            ..Default::default()
        }
    }

    fn drive(task: &mut ScanTask) -> Result<ScanSummary> {
        loop {
            match task.step() {
                StepOutcome::Done(summary) => return Ok(summary),
                StepOutcome::Failed(err) => return Err(err),
                StepOutcome::Continue | StepOutcome::Progress(_) => {}
            }
        }
    }

    fn roms_dir(dir: &TempDir) -> PathBuf {
        let roms = dir.path().join("roms");
        fs::create_dir_all(&roms).unwrap();
        roms
    }

    fn labels(dir: &TempDir, collection: &str) -> Vec<(String, String)> {
        let path = dir.path().join("playlists").join(collection);
        Collection::load_or_create(&path)
            .unwrap()
            .entries()
            .iter()
            .map(|e| (e.label.clone(), e.crc32.clone()))
            .collect()
    }

    #[test]
    fn test_size_bounds_prune_tables_without_querying() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        fs::write(roms.join("Game.nes"), ROM).unwrap();

        let (store, log) = SpyStore::new(vec![
            (
                "Big",
                vec![
                    SignatureRow::with_crc("Huge A", 1, 1000),
                    SignatureRow::with_crc("Huge B", 2, 2000),
                ],
            ),
            ("Small", vec![SignatureRow::with_crc("Game (USA)", crc32fast::hash(ROM), 13)]),
        ]);
        let mut task = ScanTask::new(&roms, options(&dir), Box::new(store)).unwrap();
        let summary = drive(&mut task).unwrap();

        assert_eq!(log.borrow().lookups, vec!["Small"]);
        assert_eq!(summary.matched, 1);
        assert_eq!(
            labels(&dir, "Small.lpl"),
            vec![("Game (USA)".to_string(), format!("{:08X}|crc", crc32fast::hash(ROM)))]
        );
    }

    #[test]
    fn test_matching_table_moves_to_front() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        let other = b"NES\x1a rom bodz";
        fs::write(roms.join("a.nes"), ROM).unwrap();
        fs::write(roms.join("b.nes"), other).unwrap();

        let (store, log) = SpyStore::new(vec![
            ("X", vec![SignatureRow::with_crc("Nope", 1, 13)]),
            ("Y", vec![SignatureRow::with_crc("Nope", 2, 13)]),
            (
                "Z",
                vec![
                    SignatureRow::with_crc("Alpha", crc32fast::hash(ROM), 13),
                    SignatureRow::with_crc("Beta", crc32fast::hash(other), 13),
                ],
            ),
        ]);
        let mut task = ScanTask::new(&roms, options(&dir), Box::new(store)).unwrap();
        drive(&mut task).unwrap();

        assert_eq!(log.borrow().lookups, vec!["X", "Y", "Z", "Z"]);
        assert_eq!(task.table_order(), vec!["Z", "X", "Y"]);
        assert_eq!(labels(&dir, "Z.lpl").len(), 2);
    }

    fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(fs::File::create(path).unwrap());
        for (name, data) in members {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_unmatched_archive_expands_members() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        let archive = roms.join("pack.zip");
        write_zip(&archive, &[("Game.gba", b"gba payload"), ("readme.txt", b"hi")]);

        let (store, _) = SpyStore::new(vec![(
            "Nintendo - Game Boy Advance",
            vec![SignatureRow::with_crc("Game (Europe)", crc32fast::hash(b"gba payload"), 11)],
        )]);
        let mut task = ScanTask::new(&roms, options(&dir), Box::new(store)).unwrap();
        let summary = drive(&mut task).unwrap();

        assert_eq!(summary.archives_expanded, 1);
        assert_eq!(summary.matched, 1);
        // readme.txt falls outside every table.
        assert_eq!(summary.unmatched, 1);
        assert_eq!(summary.candidates_examined, 3);

        let collection = Collection::load_or_create(
            &dir.path().join("playlists/Nintendo - Game Boy Advance.lpl"),
        )
        .unwrap();
        assert_eq!(
            collection.entries()[0].path,
            format!("{}#Game.gba", archive.to_string_lossy())
        );
    }

    #[test]
    fn test_archive_expands_once_per_path() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        let archive = roms.join("pack.zip");
        write_zip(&archive, &[("Game.gba", b"gba payload")]);

        let (store, _) = SpyStore::new(vec![(
            "GBA",
            vec![SignatureRow::with_crc("Game", crc32fast::hash(b"gba payload"), 11)],
        )]);
        let mut task = ScanTask::new(&roms, options(&dir), Box::new(store)).unwrap();
        task.candidates.push_back(Candidate::new(archive.clone()));
        task.total += 1;
        let summary = drive(&mut task).unwrap();

        assert_eq!(summary.archives_expanded, 1);
        assert_eq!(summary.matched, 1);
        assert_eq!(summary.unmatched, 0);
        assert_eq!(labels(&dir, "GBA.lpl").len(), 1);
    }

    #[test]
    fn test_members_fingerprinted_without_relisting_archive() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        let archive = roms.join("pack.zip");
        write_zip(&archive, &[("Game.gba", b"gba payload"), ("Other.gba", b"other")]);

        let (store, _) = SpyStore::new(vec![(
            "GBA",
            vec![SignatureRow::with_crc("Game", crc32fast::hash(b"gba payload"), 11)],
        )]);
        let mut task = ScanTask::new(&roms, options(&dir), Box::new(store)).unwrap();
        while task.summary().archives_expanded == 0 {
            assert!(!matches!(task.step(), StepOutcome::Failed(_)));
        }

        // Members only need the listing taken at expansion time.
        fs::write(&archive, b"no longer a zip").unwrap();
        let summary = drive(&mut task).unwrap();

        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.matched, 1);
        assert_eq!(
            Collection::load_or_create(&dir.path().join("playlists/GBA.lpl")).unwrap().entries()[0].path,
            format!("{}#Game.gba", archive.to_string_lossy())
        );
    }

    #[test]
    fn test_archive_checksum_match_skips_expansion() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        let archive = roms.join("pack.zip");
        write_zip(&archive, &[("Game.gba", b"gba payload")]);
        let (crc, len) = fingerprint::checksum_file(&archive).unwrap();

        let (store, _) = SpyStore::new(vec![("Arcade", vec![SignatureRow::with_crc("Pack", crc, len)])]);
        let mut task = ScanTask::new(&roms, options(&dir), Box::new(store)).unwrap();
        let summary = drive(&mut task).unwrap();

        assert_eq!(summary.archives_expanded, 0);
        assert_eq!(summary.matched, 1);
        assert_eq!(labels(&dir, "Arcade.lpl")[0].0, "Pack");
    }

    #[test]
    fn test_archives_expand_directly_when_not_candidates() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        write_zip(&roms.join("pack.zip"), &[("Game.gba", b"gba payload")]);

        let (store, log) = SpyStore::new(vec![(
            "GBA",
            vec![SignatureRow::with_crc("Game", crc32fast::hash(b"gba payload"), 11)],
        )]);
        let opts = ScanOptions {
            archive_as_candidate: false,
            ..options(&dir)
        };
        let mut task = ScanTask::new(&roms, opts, Box::new(store)).unwrap();
        let summary = drive(&mut task).unwrap();

        assert_eq!(log.borrow().lookups, vec!["GBA"]);
        assert_eq!(summary.matched, 1);
        assert_eq!(summary.unmatched, 0);
    }

    #[test]
    fn test_disc_sheet_without_serial_matches_by_checksum() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        fs::write(roms.join("Game.bin"), b"raw track data").unwrap();
        fs::write(roms.join("Game.cue"), "FILE \"Game.bin\" BINARY\n  TRACK 01 MODE1/2352\n").unwrap();
        let crc = crc32fast::hash(b"raw track data");

        let (store, _) = SpyStore::new(vec![("Sega - Mega-CD", vec![SignatureRow::with_crc("Game (Japan)", crc, 14)])]);
        let opts = ScanOptions {
            file_exts: vec!["cue".to_string()],
            ..options(&dir)
        };
        let mut task = ScanTask::new(&roms, opts, Box::new(store)).unwrap();
        let summary = drive(&mut task).unwrap();

        assert_eq!(summary.matched, 1);
        assert_eq!(
            labels(&dir, "Sega - Mega-CD.lpl"),
            vec![("Game (Japan)".to_string(), format!("{:08X}|crc", crc))]
        );
    }

    #[test]
    fn test_shared_serial_needs_checksum_confirmation() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        let track = b"BOOT = cdrom:\\SLUS_005.94;1\n";
        fs::write(roms.join("Game.bin"), track).unwrap();
        fs::write(roms.join("Game.cue"), "FILE \"Game.bin\" BINARY\n  TRACK 01 MODE2/2352\n").unwrap();

        let mut confirmed = SignatureRow::with_serial("Real Game", "SLUS-00594");
        confirmed.crc = Some(crc32fast::hash(track));
        let (store, _) = SpyStore::new(vec![
            ("Sony - PlayStation 3", vec![SignatureRow::with_serial("Lookalike", "SLUS-00594")]),
            ("Sony - PlayStation Portable", vec![confirmed]),
        ]);
        let opts = ScanOptions {
            file_exts: vec!["cue".to_string()],
            ..options(&dir)
        };
        let mut task = ScanTask::new(&roms, opts, Box::new(store)).unwrap();
        let summary = drive(&mut task).unwrap();

        assert_eq!(summary.matched, 1);
        assert!(!dir.path().join("playlists/Sony - PlayStation 3.lpl").exists());
        assert_eq!(
            labels(&dir, "Sony - PlayStation Portable.lpl"),
            vec![("Real Game".to_string(), "SLUS-00594|serial".to_string())]
        );
    }

    #[test]
    fn test_serial_miss_does_not_retry_by_checksum() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        let track = "BOOT = cdrom:\\SLUS_000.01;1\r\nTCB = 4\r\n";
        fs::write(roms.join("Foo.bin"), track).unwrap();
        fs::write(roms.join("Foo.cue"), "FILE \"Foo.bin\" BINARY\n  TRACK 01 MODE2/2352\n").unwrap();

        let (store, log) = SpyStore::new(vec![(
            "Sony - PlayStation",
            vec![
                SignatureRow::with_serial("Other", "SLUS-99999"),
                SignatureRow::with_crc("Foo", crc32fast::hash(track.as_bytes()), track.len() as u64),
            ],
        )]);
        let opts = ScanOptions {
            file_exts: vec!["cue".to_string()],
            ..options(&dir)
        };
        let mut task = ScanTask::new(&roms, opts, Box::new(store)).unwrap();
        let summary = drive(&mut task).unwrap();

        assert_eq!(summary.matched, 0);
        assert_eq!(summary.unmatched, 1);
        assert_eq!(log.borrow().lookups, vec!["Sony - PlayStation"]);
    }

    #[test]
    fn test_cancel_discards_results() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        fs::write(roms.join("Game.nes"), ROM).unwrap();

        let (store, log) = SpyStore::new(vec![("NES", vec![SignatureRow::with_crc("Game", crc32fast::hash(ROM), 13)])]);
        let token = CancellationToken::new();
        let mut task = ScanTask::new(&roms, options(&dir), Box::new(store))
            .unwrap()
            .with_cancel_token(token.clone());

        // Run until the match is committed, then cancel before writing.
        while task.results().count() == 0 {
            assert!(!matches!(task.step(), StepOutcome::Failed(_)));
        }
        token.cancel();

        assert_eq!(log.borrow().releases, 0);
        assert!(matches!(task.step(), StepOutcome::Failed(ScanError::Cancelled)));
        assert_eq!(log.borrow().releases, 1, "store handles closed on cancel");
        assert!(matches!(task.step(), StepOutcome::Failed(ScanError::Aborted(_))));
        assert_eq!(task.results().count(), 0);
        assert!(!dir.path().join("playlists").exists());
    }

    #[test]
    fn test_completed_scan_releases_store() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        fs::write(roms.join("Game.nes"), ROM).unwrap();

        let (store, log) = SpyStore::new(vec![("NES", vec![SignatureRow::with_crc("Game", crc32fast::hash(ROM), 13)])]);
        let mut task = ScanTask::new(&roms, options(&dir), Box::new(store)).unwrap();
        drive(&mut task).unwrap();
        assert_eq!(log.borrow().releases, 1);
    }

    #[test]
    fn test_unavailable_table_skipped_for_rest_of_scan() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        let other = b"NES\x1a rom bodz";
        fs::write(roms.join("a.nes"), ROM).unwrap();
        fs::write(roms.join("b.nes"), other).unwrap();

        let (store, log) = SpyStore::new(vec![(
            "NES",
            vec![
                SignatureRow::with_crc("Alpha", crc32fast::hash(ROM), 13),
                SignatureRow::with_crc("Beta", crc32fast::hash(other), 13),
            ],
        )]);
        let store = store.with_broken("Broken");
        let mut task = ScanTask::new(&roms, options(&dir), Box::new(store)).unwrap();
        let summary = drive(&mut task).unwrap();

        assert_eq!(summary.matched, 2);
        let log = log.borrow();
        assert_eq!(log.bounds_reads.iter().filter(|t| *t == "Broken").count(), 1);
        assert!(log.lookups.iter().all(|t| t != "Broken"));
    }

    #[test]
    fn test_unreadable_candidate_skipped_in_directory_scan() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        fs::write(roms.join("Lost.cue"), "FILE \"Lost.bin\" BINARY\n  TRACK 01 MODE1/2352\n").unwrap();
        fs::write(roms.join("Game.nes"), ROM).unwrap();

        let (store, _) = SpyStore::new(vec![("NES", vec![SignatureRow::with_crc("Game", crc32fast::hash(ROM), 13)])]);
        let mut task = ScanTask::new(&roms, options(&dir), Box::new(store)).unwrap();
        let summary = drive(&mut task).unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.matched, 1);
        assert_eq!(summary.candidates_examined, 2);
        assert_eq!(labels(&dir, "NES.lpl").len(), 1);
    }

    /// Extractor that counts how often a disc image is opened.
    struct CountingExtractor {
        calls: Rc<Cell<usize>>,
    }

    impl DiscExtractor for CountingExtractor {
        fn extract(&self, path: &Path, kind: ContainerKind) -> Result<crate::disc::DiscInfo> {
            self.calls.set(self.calls.get() + 1);
            DefaultExtractor.extract(path, kind)
        }
    }

    #[test]
    fn test_fingerprint_computed_once_per_candidate() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        fs::write(roms.join("Game.bin"), b"raw track data").unwrap();
        fs::write(roms.join("Game.cue"), "FILE \"Game.bin\" BINARY\n  TRACK 01 MODE1/2352\n").unwrap();

        let (store, _) = SpyStore::new(vec![("NES", vec![SignatureRow::with_crc("Other", 1, 14)])]);
        let calls = Rc::new(Cell::new(0));
        let opts = ScanOptions {
            file_exts: vec!["cue".to_string()],
            ..options(&dir)
        };
        let mut task = ScanTask::new(&roms, opts, Box::new(store))
            .unwrap()
            .with_extractor(Box::new(CountingExtractor { calls: calls.clone() }));
        task.candidates.push_back(Candidate::new(roms.join("Game.cue")));
        task.total += 1;
        let summary = drive(&mut task).unwrap();

        assert_eq!(summary.candidates_examined, 2);
        assert_eq!(summary.unmatched, 2);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_paused_task_does_no_work() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        fs::write(roms.join("Game.nes"), ROM).unwrap();

        let (store, log) = SpyStore::new(vec![("NES", vec![SignatureRow::with_crc("Game", 9, 13)])]);
        let mut task = ScanTask::new(&roms, options(&dir), Box::new(store)).unwrap();
        task.cancel_token().set_paused(true);
        for _ in 0..10 {
            assert!(matches!(task.step(), StepOutcome::Continue));
        }
        assert!(log.borrow().lookups.is_empty());
        assert_eq!(task.progress(), 0);
    }

    #[test]
    fn test_first_match_only_stops_after_one_hit() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        fs::write(roms.join("a.nes"), ROM).unwrap();
        fs::write(roms.join("b.nes"), ROM).unwrap();

        let (store, _) = SpyStore::new(vec![("NES", vec![SignatureRow::with_crc("Game", crc32fast::hash(ROM), 13)])]);
        let opts = ScanOptions {
            first_match_only: true,
            ..options(&dir)
        };
        let mut task = ScanTask::new(&roms, opts, Box::new(store)).unwrap();
        let summary = drive(&mut task).unwrap();

        assert_eq!(summary.candidates_examined, 1);
        assert_eq!(summary.matched, 1);
        assert_eq!(labels(&dir, "NES.lpl").len(), 1);
    }

    #[test]
    fn test_malformed_archive_skipped_in_directory_scan() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        let mut bytes = b"PK\x03\x04".to_vec();
        bytes.extend(std::iter::repeat(0x5A).take(256));
        fs::write(roms.join("broken.zip"), &bytes).unwrap();
        fs::write(roms.join("Game.nes"), ROM).unwrap();

        let (store, _) = SpyStore::new(vec![("NES", vec![SignatureRow::with_crc("Game", crc32fast::hash(ROM), 13)])]);
        let mut task = ScanTask::new(&roms, options(&dir), Box::new(store)).unwrap();
        let summary = drive(&mut task).unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.matched, 1);
    }

    #[test]
    fn test_malformed_archive_aborts_single_file_scan() {
        let dir = tempdir().unwrap();
        let mut bytes = b"PK\x03\x04".to_vec();
        bytes.extend(std::iter::repeat(0x5A).take(256));
        let broken = dir.path().join("broken.zip");
        fs::write(&broken, &bytes).unwrap();

        let (store, _) = SpyStore::new(vec![("NES", vec![SignatureRow::with_crc("Game", 1, 13)])]);
        let mut task = ScanTask::new(&broken, options(&dir), Box::new(store)).unwrap();
        let err = drive(&mut task).unwrap_err();
        assert!(matches!(err, ScanError::MalformedContainer { .. }));
        assert!(matches!(task.step(), StepOutcome::Failed(ScanError::Aborted(_))));
    }

    #[test]
    fn test_finished_task_keeps_reporting_done() {
        let dir = tempdir().unwrap();
        let roms = roms_dir(&dir);
        let (store, _) = SpyStore::new(vec![]);
        let mut task = ScanTask::new(&roms, options(&dir), Box::new(store)).unwrap();
        let summary = drive(&mut task).unwrap();
        assert_eq!(summary, ScanSummary::default());
        assert!(matches!(task.step(), StepOutcome::Done(_)));
        assert_eq!(task.progress(), 100);
    }
}
