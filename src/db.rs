//! Persistence of successful results
//!
//! [`PersistenceWriter`] buffers records into fixed-size insert batches and
//! groups several batches per transaction. The storage backend sits behind
//! [`RecordStore`]; [`SqliteStore`] is the production implementation.

use log::{debug, error, info, warn};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::config::{
    PipelineConfig, StoreConfig, FILE_HASH_COLUMN, FILE_PATH_COLUMN, IDENTITY_COLUMN,
};
use crate::error::WriterError;
use crate::models::FileResult;

/// SQLite's default limit on bound parameters per statement
const MAX_BOUND_PARAMS: usize = 32_766;

/// One row of the catalog table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    /// Canonical column -> value
    pub values: BTreeMap<String, Option<String>>,
}

impl DatabaseRecord {
    /// Project a result onto the catalog columns.
    ///
    /// `file_path` and `file_hash` always come from the result itself; the
    /// path is stored with `/` separators.
    pub fn from_result(result: &FileResult, columns: &[String]) -> Self {
        let values = columns
            .iter()
            .map(|column| {
                let value = match column.as_str() {
                    FILE_PATH_COLUMN => Some(normalize_path(&result.path)),
                    FILE_HASH_COLUMN => Some(result.fingerprint.clone()),
                    _ => result.metadata.get(column).cloned().flatten(),
                };
                (column.clone(), value)
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(|v| v.as_deref())
    }
}

/// Normalize path separators for cross-platform consistency
pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Configured columns compared with what the store actually holds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaReport {
    pub table: String,
    pub expected: BTreeSet<String>,
    /// Empty when the table does not exist yet
    pub actual: BTreeSet<String>,
    /// Configured but not stored
    pub missing: BTreeSet<String>,
    /// Stored but not configured
    pub extra: BTreeSet<String>,
}

impl SchemaReport {
    pub fn compare(table: &str, expected: &[String], actual: BTreeSet<String>) -> Self {
        let expected: BTreeSet<String> = expected.iter().cloned().collect();
        let missing = expected.difference(&actual).cloned().collect();
        let extra = actual.difference(&expected).cloned().collect();
        Self {
            table: table.to_string(),
            expected,
            actual,
            missing,
            extra,
        }
    }

    /// The table exists
    pub fn exists(&self) -> bool {
        !self.actual.is_empty()
    }

    pub fn matches(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }

    fn into_drift(self) -> WriterError {
        WriterError::SchemaDrift {
            table: self.table,
            missing: self.missing,
            extra: self.extra,
        }
    }
}

/// Storage backend driven by the writer
pub trait RecordStore: Send {
    /// Columns of the catalog table, excluding the identity key; empty if
    /// the table does not exist
    fn columns(&self) -> Result<BTreeSet<String>, WriterError>;

    /// Create the catalog table and its indexes
    fn create(&mut self, columns: &[String]) -> Result<(), WriterError>;

    fn begin(&mut self) -> Result<(), WriterError>;

    /// One multi-row insert
    fn insert_rows(&mut self, columns: &[String], rows: &[DatabaseRecord])
        -> Result<(), WriterError>;

    fn commit(&mut self) -> Result<(), WriterError>;

    fn rollback(&mut self) -> Result<(), WriterError>;

    /// Remove the catalog table and everything in it
    fn drop_table(&mut self) -> Result<(), WriterError>;

    fn table(&self) -> &str;
}

/// SQLite-backed catalog
pub struct SqliteStore {
    conn: Connection,
    table: String,
}

impl SqliteStore {
    /// Open or create the database and apply the tuning pragmas
    pub fn open(config: &StoreConfig) -> Result<Self, WriterError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&config.path)?;
        let mode: String = conn.pragma_update_and_check(
            None,
            "journal_mode",
            &config.journal_mode,
            |row| row.get(0),
        )?;
        conn.pragma_update(None, "synchronous", &config.synchronous)?;
        conn.pragma_update(None, "cache_size", -(config.cache_size_kib as i64))?;
        debug!(
            "Opened store {:?} (journal_mode={}, synchronous={})",
            config.path, mode, config.synchronous
        );
        Ok(Self {
            conn,
            table: config.table.clone(),
        })
    }

    /// Open an existing database for inspection only; no pragmas are applied
    pub fn open_read_only(config: &StoreConfig) -> Result<Self, WriterError> {
        let conn = Connection::open_with_flags(
            &config.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn,
            table: config.table.clone(),
        })
    }

    /// Open in-memory database (for testing)
    pub fn open_memory(table: &str) -> Result<Self, WriterError> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            table: table.to_string(),
        })
    }

    /// Number of catalog rows
    pub fn row_count(&self) -> Result<u64, WriterError> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// All values of one column in insertion order
    pub fn column_values(&self, column: &str) -> Result<Vec<Option<String>>, WriterError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT \"{}\" FROM \"{}\" ORDER BY {}",
            column, self.table, IDENTITY_COLUMN
        ))?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }

    /// Names of the indexes on the catalog table
    pub fn indexes(&self) -> Result<BTreeSet<String>, WriterError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_index_list(?1)")?;
        let rows = stmt.query_map([&self.table], |row| row.get::<_, String>(0))?;
        let mut names = BTreeSet::new();
        for row in rows {
            names.insert(row?);
        }
        Ok(names)
    }
}

impl RecordStore for SqliteStore {
    fn columns(&self) -> Result<BTreeSet<String>, WriterError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_table_info(?1)")?;
        let rows = stmt.query_map([&self.table], |row| row.get::<_, String>(0))?;
        let mut columns = BTreeSet::new();
        for row in rows {
            let name = row?;
            if name != IDENTITY_COLUMN {
                columns.insert(name);
            }
        }
        Ok(columns)
    }

    fn create(&mut self, columns: &[String]) -> Result<(), WriterError> {
        let definitions: Vec<String> = columns
            .iter()
            .map(|column| format!("\"{}\" TEXT", column))
            .collect();
        let table = &self.table;
        self.conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS \"{table}\" (
                {IDENTITY_COLUMN} INTEGER PRIMARY KEY AUTOINCREMENT,
                {}
            );
            CREATE INDEX IF NOT EXISTS \"idx_{table}_{FILE_HASH_COLUMN}\" ON \"{table}\"({FILE_HASH_COLUMN});
            CREATE INDEX IF NOT EXISTS \"idx_{table}_{FILE_PATH_COLUMN}\" ON \"{table}\"({FILE_PATH_COLUMN});
            ",
            definitions.join(",\n                ")
        ))?;
        Ok(())
    }

    fn begin(&mut self) -> Result<(), WriterError> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn insert_rows(
        &mut self,
        columns: &[String],
        rows: &[DatabaseRecord],
    ) -> Result<(), WriterError> {
        if rows.is_empty() || columns.is_empty() {
            return Ok(());
        }
        let column_list: Vec<String> = columns.iter().map(|c| format!("\"{}\"", c)).collect();
        let placeholders = format!("({})", vec!["?"; columns.len()].join(","));
        let rows_per_statement = (MAX_BOUND_PARAMS / columns.len()).max(1);

        for chunk in rows.chunks(rows_per_statement) {
            let sql = format!(
                "INSERT INTO \"{}\" ({}) VALUES {}",
                self.table,
                column_list.join(","),
                vec![placeholders.as_str(); chunk.len()].join(",")
            );
            let values = chunk.iter().flat_map(move |record| {
                columns
                    .iter()
                    .map(move |column| record.values.get(column).cloned().flatten())
            });
            self.conn.execute(&sql, params_from_iter(values))?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), WriterError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), WriterError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn drop_table(&mut self) -> Result<(), WriterError> {
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS \"{}\"", self.table))?;
        Ok(())
    }

    fn table(&self) -> &str {
        &self.table
    }
}

/// Compare the configured columns with an existing store without writing.
///
/// A missing database file reports a table that does not exist.
pub fn check_schema(config: &PipelineConfig) -> Result<SchemaReport, WriterError> {
    let actual = if config.store.path.is_file() {
        SqliteStore::open_read_only(&config.store)?.columns()?
    } else {
        BTreeSet::new()
    };
    Ok(SchemaReport::compare(
        &config.store.table,
        &config.canonical_columns(),
        actual,
    ))
}

/// Batching knobs of the writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterSettings {
    pub write_batch_size: usize,
    pub transaction_batch_size: usize,
    pub write_retries: u32,
    pub max_failed_files: u64,
}

impl WriterSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            write_batch_size: config.write_batch_size.max(1),
            transaction_batch_size: config.transaction_batch_size.max(1),
            write_retries: config.write_retries,
            max_failed_files: config.max_failed_files,
        }
    }
}

/// What the writer has done so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterStats {
    pub records_received: u64,
    pub records_committed: u64,
    pub insert_batches: u64,
    pub commits: u64,
    /// Transaction replays after a failed commit
    pub retried_commits: u64,
    pub finalize_calls: u64,
    /// Records dropped after every retry failed
    pub permanently_failed: u64,
}

/// Single-writer batching front of a [`RecordStore`]
pub struct PersistenceWriter {
    store: Box<dyn RecordStore>,
    settings: WriterSettings,
    columns: Vec<String>,
    buffer: Vec<DatabaseRecord>,
    /// Insert batches of the open transaction, kept for replay
    transaction: Vec<Vec<DatabaseRecord>>,
    in_transaction: bool,
    stats: WriterStats,
}

impl PersistenceWriter {
    pub fn new(store: Box<dyn RecordStore>, settings: WriterSettings) -> Self {
        Self {
            store,
            settings,
            columns: Vec::new(),
            buffer: Vec::new(),
            transaction: Vec::new(),
            in_transaction: false,
            stats: WriterStats::default(),
        }
    }

    /// Open the configured SQLite store
    pub fn open(config: &PipelineConfig) -> Result<Self, WriterError> {
        let store = SqliteStore::open(&config.store)?;
        Ok(Self::new(Box::new(store), WriterSettings::from_config(config)))
    }

    /// Create the table for `schema_fields`, or verify an existing one.
    ///
    /// Drift is reported, never patched.
    pub fn init(&mut self, schema_fields: &[String]) -> Result<SchemaReport, WriterError> {
        self.columns = schema_fields.to_vec();
        let report = self.schema_report()?;
        if !report.exists() {
            self.store.create(&self.columns)?;
            info!(
                "Created table {} with {} columns",
                self.store.table(),
                self.columns.len()
            );
            return self.schema_report();
        }
        if !report.matches() {
            error!(
                "Schema drift on {}: missing {:?}, extra {:?}",
                report.table, report.missing, report.extra
            );
            return Err(report.into_drift());
        }
        Ok(report)
    }

    pub fn schema_report(&self) -> Result<SchemaReport, WriterError> {
        Ok(SchemaReport::compare(
            self.store.table(),
            &self.columns,
            self.store.columns()?,
        ))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn write(&mut self, record: DatabaseRecord) -> Result<(), WriterError> {
        self.write_batch(vec![record])
    }

    /// Buffer records, inserting every full write batch and committing
    /// every `transaction_batch_size` inserts
    pub fn write_batch(&mut self, records: Vec<DatabaseRecord>) -> Result<(), WriterError> {
        self.stats.records_received += records.len() as u64;
        self.buffer.extend(records);
        while self.buffer.len() >= self.settings.write_batch_size {
            let batch: Vec<DatabaseRecord> =
                self.buffer.drain(..self.settings.write_batch_size).collect();
            self.insert(batch)?;
        }
        Ok(())
    }

    /// Insert whatever is buffered and commit the open transaction
    pub fn finalize(&mut self) -> Result<(), WriterError> {
        self.stats.finalize_calls += 1;
        self.flush()
    }

    /// Delete the catalog and start over with an empty table
    pub fn clear_store(&mut self) -> Result<(), WriterError> {
        self.flush()?;
        self.store.drop_table()?;
        info!("Cleared table {}", self.store.table());
        if !self.columns.is_empty() {
            self.store.create(&self.columns)?;
        }
        Ok(())
    }

    /// Nothing buffered and no open transaction
    pub fn is_drained(&self) -> bool {
        self.buffer.is_empty() && !self.in_transaction
    }

    pub fn pending_records(&self) -> usize {
        self.buffer.len() + self.transaction.iter().map(Vec::len).sum::<usize>()
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    fn flush(&mut self) -> Result<(), WriterError> {
        if !self.buffer.is_empty() {
            let batch = std::mem::take(&mut self.buffer);
            self.insert(batch)?;
        }
        self.commit()
    }

    fn insert(&mut self, batch: Vec<DatabaseRecord>) -> Result<(), WriterError> {
        self.stats.insert_batches += 1;
        let outcome = match self.begin_if_needed() {
            Ok(()) => self.store.insert_rows(&self.columns, &batch),
            Err(e) => Err(e),
        };
        self.transaction.push(batch);
        if let Err(e) = outcome {
            warn!("Insert into {} failed: {}", self.store.table(), e);
            return self.recover();
        }
        if self.transaction.len() >= self.settings.transaction_batch_size {
            self.commit()?;
        }
        Ok(())
    }

    fn begin_if_needed(&mut self) -> Result<(), WriterError> {
        if !self.in_transaction {
            self.store.begin()?;
            self.in_transaction = true;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), WriterError> {
        if !self.in_transaction {
            return Ok(());
        }
        match self.store.commit() {
            Ok(()) => {
                self.committed();
                Ok(())
            }
            Err(e) => {
                warn!("Commit on {} failed: {}", self.store.table(), e);
                self.recover()
            }
        }
    }

    /// Roll back and replay the whole pending transaction up to
    /// `write_retries` times, then drop its records
    fn recover(&mut self) -> Result<(), WriterError> {
        let _ = self.store.rollback();
        for attempt in 1..=self.settings.write_retries {
            self.stats.retried_commits += 1;
            match self.replay() {
                Ok(()) => {
                    debug!("Transaction replay {} succeeded", attempt);
                    self.committed();
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Transaction replay {}/{} failed: {}",
                        attempt, self.settings.write_retries, e
                    );
                    let _ = self.store.rollback();
                }
            }
        }

        let lost: usize = self.transaction.drain(..).map(|batch| batch.len()).sum();
        self.in_transaction = false;
        self.stats.permanently_failed += lost as u64;
        error!(
            "Dropped {} records after {} retries ({} permanently failed so far)",
            lost, self.settings.write_retries, self.stats.permanently_failed
        );
        if self.stats.permanently_failed > self.settings.max_failed_files {
            return Err(WriterError::TooManyFailures {
                failed: self.stats.permanently_failed,
                limit: self.settings.max_failed_files,
            });
        }
        Ok(())
    }

    fn replay(&mut self) -> Result<(), WriterError> {
        self.store.begin()?;
        for batch in &self.transaction {
            self.store.insert_rows(&self.columns, batch)?;
        }
        self.store.commit()
    }

    fn committed(&mut self) {
        let rows: usize = self.transaction.drain(..).map(|batch| batch.len()).sum();
        self.stats.records_committed += rows as u64;
        self.stats.commits += 1;
        self.in_transaction = false;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{ExtractStatus, FileKind, MetadataMap};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum StoreCall {
        Begin,
        Insert(usize),
        Commit,
        Rollback,
        Drop,
    }

    /// In-memory store recording every call; commits fail while
    /// `failing_commits` is positive
    #[derive(Clone, Default)]
    pub(crate) struct RecordingStore {
        pub calls: Arc<Mutex<Vec<StoreCall>>>,
        pub rows: Arc<Mutex<Vec<DatabaseRecord>>>,
        pub failing_commits: Arc<Mutex<u32>>,
        staged: Arc<Mutex<Vec<DatabaseRecord>>>,
        columns: Arc<Mutex<BTreeSet<String>>>,
    }

    impl RecordingStore {
        pub fn failing(commits: u32) -> Self {
            let store = Self::default();
            *store.failing_commits.lock().unwrap() = commits;
            store
        }

        pub fn calls(&self) -> Vec<StoreCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn inserts(&self) -> Vec<usize> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    StoreCall::Insert(n) => Some(n),
                    _ => None,
                })
                .collect()
        }

        pub fn count(&self, call: &StoreCall) -> usize {
            self.calls().iter().filter(|c| *c == call).count()
        }
    }

    impl RecordStore for RecordingStore {
        fn columns(&self) -> Result<BTreeSet<String>, WriterError> {
            Ok(self.columns.lock().unwrap().clone())
        }

        fn create(&mut self, columns: &[String]) -> Result<(), WriterError> {
            *self.columns.lock().unwrap() = columns.iter().cloned().collect();
            Ok(())
        }

        fn begin(&mut self) -> Result<(), WriterError> {
            self.calls.lock().unwrap().push(StoreCall::Begin);
            Ok(())
        }

        fn insert_rows(
            &mut self,
            _columns: &[String],
            rows: &[DatabaseRecord],
        ) -> Result<(), WriterError> {
            self.calls.lock().unwrap().push(StoreCall::Insert(rows.len()));
            self.staged.lock().unwrap().extend(rows.iter().cloned());
            Ok(())
        }

        fn commit(&mut self) -> Result<(), WriterError> {
            self.calls.lock().unwrap().push(StoreCall::Commit);
            let mut failing = self.failing_commits.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(WriterError::Other("commit rejected".to_string()));
            }
            let staged: Vec<DatabaseRecord> = self.staged.lock().unwrap().drain(..).collect();
            self.rows.lock().unwrap().extend(staged);
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), WriterError> {
            self.calls.lock().unwrap().push(StoreCall::Rollback);
            self.staged.lock().unwrap().clear();
            Ok(())
        }

        fn drop_table(&mut self) -> Result<(), WriterError> {
            self.calls.lock().unwrap().push(StoreCall::Drop);
            self.rows.lock().unwrap().clear();
            self.columns.lock().unwrap().clear();
            Ok(())
        }

        fn table(&self) -> &str {
            "media"
        }
    }

    pub(crate) fn settings(write: usize, tx: usize, retries: u32, max_failed: u64) -> WriterSettings {
        WriterSettings {
            write_batch_size: write,
            transaction_batch_size: tx,
            write_retries: retries,
            max_failed_files: max_failed,
        }
    }

    fn columns() -> Vec<String> {
        PipelineConfig::default().canonical_columns()
    }

    fn record(i: usize) -> DatabaseRecord {
        let result = FileResult {
            path: PathBuf::from(format!("/photos/{i}.jpg")),
            kind: FileKind::Image,
            worker_id: 0,
            success: true,
            extract_status: ExtractStatus::Success,
            metadata: MetadataMap::new(),
            fingerprint: format!("hash{i}"),
            duration_ms: 0,
            log_entries: Vec::new(),
            error: None,
        };
        DatabaseRecord::from_result(&result, &columns())
    }

    #[test]
    fn test_record_overlays_path_and_hash() {
        let mut metadata = MetadataMap::new();
        metadata.insert("make".to_string(), Some("Nikon".to_string()));
        metadata.insert(FILE_PATH_COLUMN.to_string(), Some("bogus".to_string()));
        let result = FileResult {
            path: PathBuf::from(r"C:\photos\a.jpg"),
            kind: FileKind::Image,
            worker_id: 1,
            success: true,
            extract_status: ExtractStatus::Success,
            metadata,
            fingerprint: "abc".to_string(),
            duration_ms: 0,
            log_entries: Vec::new(),
            error: None,
        };
        let record = DatabaseRecord::from_result(&result, &columns());
        assert_eq!(record.get(FILE_PATH_COLUMN), Some("C:/photos/a.jpg"));
        assert_eq!(record.get(FILE_HASH_COLUMN), Some("abc"));
        assert_eq!(record.get("make"), Some("Nikon"));
        assert_eq!(record.get("model"), None);
        assert_eq!(record.values.len(), columns().len());
    }

    #[test]
    fn test_transaction_batching() {
        let store = RecordingStore::default();
        let mut writer = PersistenceWriter::new(Box::new(store.clone()), settings(2, 3, 3, 10));
        writer.init(&columns()).unwrap();

        for i in 0..7 {
            writer.write(record(i)).unwrap();
        }
        assert_eq!(store.inserts(), vec![2, 2, 2]);
        assert_eq!(store.count(&StoreCall::Commit), 1);
        assert_eq!(writer.pending_records(), 1);
        assert!(!writer.is_drained());

        writer.finalize().unwrap();
        assert_eq!(store.inserts(), vec![2, 2, 2, 1]);
        assert_eq!(store.count(&StoreCall::Commit), 2);
        assert!(writer.is_drained());

        let stats = writer.stats();
        assert_eq!(stats.insert_batches, 4);
        assert_eq!(stats.commits, 2);
        assert_eq!(stats.records_committed, 7);
        assert_eq!(stats.finalize_calls, 1);
        assert_eq!(store.rows.lock().unwrap().len(), 7);
    }

    #[test]
    fn test_failed_commit_replays_whole_transaction() {
        let store = RecordingStore::failing(1);
        let mut writer = PersistenceWriter::new(Box::new(store.clone()), settings(2, 2, 3, 10));
        writer.init(&columns()).unwrap();
        writer
            .write_batch((0..4).map(record).collect())
            .unwrap();

        assert_eq!(
            store.calls(),
            vec![
                StoreCall::Begin,
                StoreCall::Insert(2),
                StoreCall::Insert(2),
                StoreCall::Commit,
                StoreCall::Rollback,
                StoreCall::Begin,
                StoreCall::Insert(2),
                StoreCall::Insert(2),
                StoreCall::Commit,
            ]
        );
        let stats = writer.stats();
        assert_eq!(stats.retried_commits, 1);
        assert_eq!(stats.records_committed, 4);
        assert_eq!(stats.permanently_failed, 0);
        assert_eq!(store.rows.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_exhausted_retries_drop_records_until_limit() {
        let store = RecordingStore::failing(u32::MAX);
        let mut writer = PersistenceWriter::new(Box::new(store.clone()), settings(2, 1, 2, 3));
        writer.init(&columns()).unwrap();

        // First transaction of 2 records is dropped but tolerated
        writer.write_batch(vec![record(0), record(1)]).unwrap();
        assert_eq!(writer.stats().permanently_failed, 2);
        assert_eq!(writer.stats().retried_commits, 2);
        assert!(writer.is_drained());

        // The second pushes the total past the limit
        let err = writer
            .write_batch(vec![record(2), record(3)])
            .unwrap_err();
        assert!(matches!(
            err,
            WriterError::TooManyFailures { failed: 4, limit: 3 }
        ));
    }

    #[test]
    fn test_finalize_with_nothing_pending() {
        let store = RecordingStore::default();
        let mut writer = PersistenceWriter::new(Box::new(store.clone()), settings(5, 5, 0, 0));
        writer.init(&columns()).unwrap();
        writer.finalize().unwrap();
        assert!(store.calls().is_empty());
        assert_eq!(writer.stats().finalize_calls, 1);
    }

    #[test]
    fn test_clear_store_flushes_first() {
        let store = RecordingStore::default();
        let mut writer = PersistenceWriter::new(Box::new(store.clone()), settings(10, 10, 0, 0));
        writer.init(&columns()).unwrap();
        writer.write(record(0)).unwrap();
        writer.clear_store().unwrap();

        assert_eq!(
            store.calls(),
            vec![
                StoreCall::Begin,
                StoreCall::Insert(1),
                StoreCall::Commit,
                StoreCall::Drop,
            ]
        );
        assert!(store.rows.lock().unwrap().is_empty());
        assert!(writer.schema_report().unwrap().matches());
        assert_eq!(writer.stats().finalize_calls, 0);
    }

    #[test]
    fn test_sqlite_store_round_trip() {
        let store = SqliteStore::open_memory("media").unwrap();
        let mut writer = PersistenceWriter::new(Box::new(store), settings(2, 2, 1, 10));
        let report = writer.init(&columns()).unwrap();
        assert!(report.matches());
        assert!(report.exists());

        writer.write_batch((0..5).map(record).collect()).unwrap();
        writer.finalize().unwrap();
        assert_eq!(writer.stats().records_committed, 5);
    }

    #[test]
    fn test_sqlite_schema_and_indexes() {
        let tmp = tempfile::tempdir().unwrap();
        let config = PipelineConfig::builder()
            .db_path(tmp.path().join("catalog.db"))
            .build()
            .unwrap();

        let before = check_schema(&config).unwrap();
        assert!(!before.exists());
        assert!(!config.store.path.exists());

        let mut writer = PersistenceWriter::open(&config).unwrap();
        writer.init(&config.canonical_columns()).unwrap();
        writer.write_batch((0..3).map(record).collect()).unwrap();
        writer.finalize().unwrap();
        drop(writer);

        let store = SqliteStore::open(&config.store).unwrap();
        assert_eq!(store.row_count().unwrap(), 3);
        assert_eq!(
            store.column_values(FILE_HASH_COLUMN).unwrap(),
            vec![
                Some("hash0".to_string()),
                Some("hash1".to_string()),
                Some("hash2".to_string())
            ]
        );
        let indexes = store.indexes().unwrap();
        assert!(indexes.contains("idx_media_file_hash"));
        assert!(indexes.contains("idx_media_file_path"));

        let after = check_schema(&config).unwrap();
        assert!(after.matches());
        assert_eq!(after.actual, after.expected);
    }

    #[test]
    fn test_schema_check_leaves_store_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = PipelineConfig::builder()
            .db_path(tmp.path().join("missing/dir/catalog.db"))
            .build()
            .unwrap();
        assert!(!check_schema(&nested).unwrap().exists());
        assert!(!tmp.path().join("missing").exists());

        let config = PipelineConfig::builder()
            .db_path(tmp.path().join("catalog.db"))
            .build()
            .unwrap();
        let conn = Connection::open(&config.store.path).unwrap();
        conn.execute_batch("CREATE TABLE media (id INTEGER PRIMARY KEY, file_path TEXT)")
            .unwrap();
        drop(conn);

        let report = check_schema(&config).unwrap();
        assert!(report.exists());
        assert!(!report.matches());
        assert!(report.extra.is_empty());

        let conn = Connection::open(&config.store.path).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "delete");
    }

    #[test]
    fn test_schema_drift_is_reported_not_patched() {
        let tmp = tempfile::tempdir().unwrap();
        let config = PipelineConfig::builder()
            .db_path(tmp.path().join("catalog.db"))
            .build()
            .unwrap();
        let mut writer = PersistenceWriter::open(&config).unwrap();
        writer
            .init(&["file_path".to_string(), "file_hash".to_string(), "legacy".to_string()])
            .unwrap();
        drop(writer);

        let mut writer = PersistenceWriter::open(&config).unwrap();
        let err = writer.init(&config.canonical_columns()).unwrap_err();
        match err {
            WriterError::SchemaDrift { missing, extra, .. } => {
                assert!(missing.contains("make"));
                assert_eq!(extra, BTreeSet::from(["legacy".to_string()]));
            }
            other => panic!("unexpected error: {other}"),
        }

        let store = SqliteStore::open(&config.store).unwrap();
        assert!(store.columns().unwrap().contains("legacy"));
        assert!(!store.columns().unwrap().contains("make"));
    }

    #[test]
    fn test_sqlite_clear_store_recreates_empty_table() {
        let tmp = tempfile::tempdir().unwrap();
        let config = PipelineConfig::builder()
            .db_path(tmp.path().join("catalog.db"))
            .build()
            .unwrap();
        let mut writer = PersistenceWriter::open(&config).unwrap();
        writer.init(&config.canonical_columns()).unwrap();
        writer.write_batch((0..4).map(record).collect()).unwrap();
        writer.finalize().unwrap();
        writer.clear_store().unwrap();
        drop(writer);

        let store = SqliteStore::open(&config.store).unwrap();
        assert_eq!(store.row_count().unwrap(), 0);
    }
}
