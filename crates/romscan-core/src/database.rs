//! Signature tables and the ordered index the scanner searches.
//!
//! Each table is a SQLite file `<Name>.db` holding one `signatures` table.
//! Bounds (size range and which identifier columns are populated) are read
//! once per table per scan and cached on the [`DatabaseTable`].

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags};
use tracing::{debug, warn};

use crate::error::{Result, ScanError};
use crate::fingerprint::Fingerprint;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS signatures (
    name   TEXT NOT NULL,
    crc    INTEGER,
    serial TEXT,
    size   INTEGER
);
CREATE INDEX IF NOT EXISTS signatures_crc ON signatures (crc);
CREATE INDEX IF NOT EXISTS signatures_serial ON signatures (serial);";

/// One known title in a signature table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRow {
    pub name: String,
    pub crc: Option<u32>,
    pub serial: Option<String>,
    pub size: Option<u64>,
}

impl SignatureRow {
    pub fn with_crc(name: &str, crc: u32, size: u64) -> Self {
        Self {
            name: name.to_string(),
            crc: Some(crc),
            serial: None,
            size: Some(size),
        }
    }

    pub fn with_serial(name: &str, serial: &str) -> Self {
        Self {
            name: name.to_string(),
            crc: None,
            serial: Some(serial.to_string()),
            size: None,
        }
    }
}

/// Result of the single bounds query run against a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableBounds {
    pub size_min: Option<i64>,
    pub size_max: Option<i64>,
    pub has_serial: bool,
    pub has_checksum: bool,
}

impl TableBounds {
    fn contains(&self, len: u64) -> bool {
        match (self.size_min, self.size_max) {
            (Some(min), Some(max)) => len != 0 && min <= len as i64 && len as i64 <= max,
            _ => true,
        }
    }

    /// Whether the table can be skipped without querying it.
    ///
    /// Only applies when both bounds are known and the candidate declares a
    /// nonzero length; the table is skipped when neither the top-level nor the
    /// archive length falls inside `[size_min, size_max]`.
    pub fn excludes(&self, fp: &Fingerprint) -> bool {
        if self.size_min.is_none() || self.size_max.is_none() || fp.byte_len == 0 {
            return false;
        }
        !self.contains(fp.byte_len) && !self.contains(fp.archive_byte_len)
    }
}

/// A lookup against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Serial(String),
    /// Matches rows whose crc equals either value.
    Checksum {
        checksum: u32,
        archive_checksum: Option<u32>,
    },
}

impl Query {
    /// Choose how to look a fingerprint up in a table with these bounds.
    ///
    /// Serials win when both sides have them; `None` means the table cannot
    /// identify this fingerprint at all.
    pub fn for_table(fp: &Fingerprint, bounds: &TableBounds) -> Option<Query> {
        if let Some(serial) = &fp.serial {
            if bounds.has_serial {
                return Some(Query::Serial(serial.clone()));
            }
        }
        if bounds.has_checksum {
            if let Some(checksum) = fp.checksum {
                return Some(Query::Checksum {
                    checksum,
                    archive_checksum: fp.archive_checksum,
                });
            }
        }
        None
    }

    /// Exact comparison of a returned row against this query.
    pub fn matches(&self, row: &SignatureRow) -> bool {
        match self {
            Query::Serial(serial) => row.serial.as_deref() == Some(serial.as_str()),
            Query::Checksum {
                checksum,
                archive_checksum,
            } => match row.crc {
                Some(crc) => crc == *checksum || Some(crc) == *archive_checksum,
                None => false,
            },
        }
    }
}

/// Backend holding the signature tables.
pub trait SignatureStore {
    /// Names of every available table, in default search order.
    fn table_names(&self) -> Result<Vec<String>>;

    fn read_bounds(&mut self, table: &str) -> Result<TableBounds>;

    fn lookup_checksum(
        &mut self,
        table: &str,
        checksum: u32,
        archive_checksum: Option<u32>,
    ) -> Result<Vec<SignatureRow>>;

    fn lookup_serial(&mut self, table: &str, serial: &str) -> Result<Vec<SignatureRow>>;

    /// Close any open handles; later lookups may reopen them.
    fn release(&mut self) {}

    fn lookup(&mut self, table: &str, query: &Query) -> Result<Vec<SignatureRow>> {
        match query {
            Query::Serial(serial) => self.lookup_serial(table, serial),
            Query::Checksum {
                checksum,
                archive_checksum,
            } => self.lookup_checksum(table, *checksum, *archive_checksum),
        }
    }
}

/// Directory of `<Name>.db` SQLite signature tables.
pub struct SqliteStore {
    dir: PathBuf,
    connections: HashMap<String, Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("dir", &self.dir)
            .field("open_tables", &self.connections.len())
            .finish()
    }
}

fn unavailable(table: &str, err: impl std::fmt::Display) -> ScanError {
    ScanError::DatabaseUnavailable {
        table: table.to_string(),
        reason: err.to_string(),
    }
}

impl SqliteStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            connections: HashMap::new(),
        }
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.db", table))
    }

    fn connection(&mut self, table: &str) -> Result<&Connection> {
        if !self.connections.contains_key(table) {
            let path = self.table_path(table);
            if !path.is_file() {
                return Err(unavailable(table, format!("{} not found", path.display())));
            }
            let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .map_err(|e| unavailable(table, e))?;
            debug!("Opened signature table {}", path.display());
            self.connections.insert(table.to_string(), conn);
        }
        self.connections
            .get(table)
            .ok_or_else(|| unavailable(table, "connection dropped"))
    }

    /// Write a signature table file, replacing any existing one.
    pub fn create_table(dir: &Path, table: &str, rows: &[SignatureRow]) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.db", table));
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let mut conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO signatures (name, crc, serial, size) VALUES (?1, ?2, ?3, ?4)")?;
            for row in rows {
                stmt.execute(params![
                    row.name,
                    row.crc.map(i64::from),
                    row.serial,
                    row.size.map(|s| s as i64),
                ])?;
            }
        }
        tx.commit()?;
        Ok(path)
    }

    fn query_rows(
        &mut self,
        table: &str,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<SignatureRow>> {
        let conn = self.connection(table)?;
        let mut stmt = conn.prepare_cached(sql).map_err(|e| unavailable(table, e))?;
        let rows = stmt
            .query_map(args, |row| {
                let crc: Option<i64> = row.get(1)?;
                let size: Option<i64> = row.get(3)?;
                Ok(SignatureRow {
                    name: row.get(0)?,
                    crc: crc.map(|c| c as u32),
                    serial: row.get(2)?,
                    size: size.map(|s| s as u64),
                })
            })
            .map_err(|e| unavailable(table, e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| unavailable(table, e))
    }
}

impl SignatureStore for SqliteStore {
    fn table_names(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| ScanError::unreadable(&self.dir, e))?;
        let mut names: Vec<String> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "db"))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    fn read_bounds(&mut self, table: &str) -> Result<TableBounds> {
        let conn = self.connection(table)?;
        let (size_min, size_max, serials, crcs): (Option<i64>, Option<i64>, i64, i64) = conn
            .query_row(
                "SELECT MIN(size), MAX(size), COUNT(serial), COUNT(crc) FROM signatures",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .map_err(|e| unavailable(table, e))?;
        Ok(TableBounds {
            size_min,
            size_max,
            has_serial: serials > 0,
            has_checksum: crcs > 0,
        })
    }

    fn lookup_checksum(
        &mut self,
        table: &str,
        checksum: u32,
        archive_checksum: Option<u32>,
    ) -> Result<Vec<SignatureRow>> {
        let direct = i64::from(checksum);
        let outer = archive_checksum.map(i64::from).unwrap_or(direct);
        self.query_rows(
            table,
            "SELECT name, crc, serial, size FROM signatures WHERE crc = ?1 OR crc = ?2",
            &[&direct, &outer],
        )
    }

    fn lookup_serial(&mut self, table: &str, serial: &str) -> Result<Vec<SignatureRow>> {
        self.query_rows(
            table,
            "SELECT name, crc, serial, size FROM signatures WHERE serial = ?1",
            &[&serial],
        )
    }

    fn release(&mut self) {
        if !self.connections.is_empty() {
            debug!("Closing {} signature table(s)", self.connections.len());
        }
        self.connections.clear();
    }
}

/// A table's place in the search order, with its cached bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseTable {
    pub name: String,
    pub bounds: Option<TableBounds>,
    pub matched_recently: bool,
    /// Serial hits here must be confirmed by checksum.
    pub shares_serials: bool,
    /// Set after the table failed to open; skipped for the rest of the scan.
    pub unavailable: bool,
}

impl DatabaseTable {
    pub fn new(name: &str, shares_serials: bool) -> Self {
        Self {
            name: name.to_string(),
            bounds: None,
            matched_recently: false,
            shares_serials,
            unavailable: false,
        }
    }

    /// Collection file name for matches from this table.
    pub fn collection_name(&self) -> String {
        format!("{}.lpl", self.name)
    }
}

/// Ordered, scan-scoped view of the signature tables.
pub struct DatabaseIndex {
    store: Box<dyn SignatureStore>,
    tables: VecDeque<DatabaseTable>,
}

impl std::fmt::Debug for DatabaseIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseIndex")
            .field("tables", &self.tables)
            .finish()
    }
}

impl DatabaseIndex {
    /// Build the index over `store`.
    ///
    /// `only` restricts the search to the named tables, preserving the store's
    /// order; `shared_serials` names tables whose serial hits need a checksum.
    pub fn new(
        store: Box<dyn SignatureStore>,
        only: Option<&[String]>,
        shared_serials: &[String],
    ) -> Result<Self> {
        let tables = store
            .table_names()?
            .into_iter()
            .filter(|name| only.map_or(true, |allowed| allowed.contains(name)))
            .map(|name| {
                let shares = shared_serials.contains(&name);
                DatabaseTable::new(&name, shares)
            })
            .collect();
        Ok(Self { store, tables })
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table(&self, index: usize) -> Option<&DatabaseTable> {
        self.tables.get(index)
    }

    /// Table names in current search order.
    pub fn order(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// Cached bounds for a table, read from the store on first use.
    ///
    /// A table whose bounds cannot be read is marked unavailable and reported as
    /// `DatabaseUnavailable`.
    pub fn bounds(&mut self, index: usize) -> Result<TableBounds> {
        let Some(table) = self.tables.get_mut(index) else {
            return Err(unavailable("<none>", format!("no table at position {}", index)));
        };
        if table.unavailable {
            return Err(unavailable(&table.name, "previously failed"));
        }
        if let Some(bounds) = table.bounds {
            return Ok(bounds);
        }
        match self.store.read_bounds(&table.name) {
            Ok(bounds) => {
                debug!(
                    "Bounds for {}: size {:?}..{:?}, serial={}, crc={}",
                    table.name, bounds.size_min, bounds.size_max, bounds.has_serial, bounds.has_checksum
                );
                table.bounds = Some(bounds);
                Ok(bounds)
            }
            Err(e) => {
                warn!("Skipping signature table {}: {}", table.name, e);
                table.unavailable = true;
                Err(e)
            }
        }
    }

    /// Run a lookup against the table at `index`.
    pub fn lookup(&mut self, index: usize, query: &Query) -> Result<Vec<SignatureRow>> {
        let Some(table) = self.tables.get_mut(index) else {
            return Ok(Vec::new());
        };
        match self.store.lookup(&table.name, query) {
            Ok(rows) => Ok(rows),
            Err(e) => {
                warn!("Skipping signature table {}: {}", table.name, e);
                table.unavailable = true;
                Err(e)
            }
        }
    }

    /// Drop the store's open handles once the scan no longer needs them.
    pub fn release(&mut self) {
        self.store.release();
    }

    /// Move the table at `index` to the front of the search order.
    pub fn promote(&mut self, index: usize) {
        if let Some(mut table) = self.tables.remove(index) {
            table.matched_recently = true;
            self.tables.push_front(table);
        }
    }
}
