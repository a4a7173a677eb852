//! Append-only CSV store of [`MetricRecord`]s.
//!
//! There is exactly one [`StoreWriter`] per process; it is the only handle
//! able to append. [`MetricsStore`] handles are cheap to clone and only read.
//! Every append is a single newline-terminated buffer written in one call, and
//! readers ignore any trailing bytes after the last newline, so a row that is
//! still being written is never observed half-populated.

use crate::{
    Result, StoreError,
    record::{MetricRecord, STORE_COLUMNS},
};
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord, Terminator, Trim, WriterBuilder};
use mockall::automock;
use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// Columns every readable layout must carry.
const REQUIRED_COLUMNS: [&str; 2] = ["timestamp", "throughput_mbps"];

/// Read handle onto the store file.
#[derive(Debug, Clone)]
pub struct MetricsStore {
    path: PathBuf,
}

impl MetricsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Full history in insertion order. A missing store is an empty history.
    ///
    /// Files written by older tooling with fewer columns are read too; the
    /// columns they lack load as absent.
    pub fn load_all(&self) -> Result<Vec<MetricRecord>> {
        let Some(bytes) = self.read_complete()? else {
            return Ok(Vec::new());
        };

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(Trim::Headers)
            .from_reader(bytes.as_slice());

        let headers = reader.headers().map_err(|source| self.csv_err(source))?;
        self.check_header(headers)?;

        let mut records = Vec::new();
        for row in reader.deserialize::<MetricRecord>() {
            records.push(row.map_err(|source| self.csv_err(source))?);
        }
        Ok(records)
    }

    /// Header names, trimmed. `None` for a missing or empty store.
    pub fn columns(&self) -> Result<Option<Vec<String>>> {
        let Some(bytes) = self.read_complete()? else {
            return Ok(None);
        };
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(Trim::Headers)
            .from_reader(bytes.as_slice());
        let headers = reader.headers().map_err(|source| self.csv_err(source))?;
        Ok(Some(headers.iter().map(str::to_string).collect()))
    }

    /// Bytes up to and including the last newline, `None` when there are none.
    fn read_complete(&self) -> Result<Option<Vec<u8>>> {
        if !self.exists() {
            return Ok(None);
        }
        let mut bytes = fs::read(&self.path).map_err(|source| self.io_err(source))?;
        let keep = complete_rows(&bytes).len();
        if keep == 0 {
            return Ok(None);
        }
        bytes.truncate(keep);
        Ok(Some(bytes))
    }

    /// Accepts the current layout and any older one that is a subset of it
    /// and still carries `timestamp` and `throughput_mbps`.
    fn check_header(&self, headers: &StringRecord) -> Result<()> {
        let known = headers
            .iter()
            .all(|name| STORE_COLUMNS.iter().any(|column| *column == name));
        let unique = headers
            .iter()
            .enumerate()
            .all(|(i, name)| !headers.iter().take(i).any(|prev| prev == name));
        let required = REQUIRED_COLUMNS
            .iter()
            .all(|column| headers.iter().any(|name| name == *column));

        if !(known && unique && required) {
            return Err(self.header_err(headers.iter()).into());
        }
        Ok(())
    }

    fn header_err<'a>(&self, found: impl Iterator<Item = &'a str>) -> StoreError {
        StoreError::Header {
            path: self.path.clone(),
            found: found.collect::<Vec<_>>().join(","),
        }
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn csv_err(&self, source: csv::Error) -> StoreError {
        StoreError::Csv {
            path: self.path.clone(),
            source,
        }
    }
}

/// The single append handle.
#[derive(Debug)]
pub struct StoreWriter {
    store: MetricsStore,
    file: File,
    /// Length of the file up to the last fully written row.
    committed_len: u64,
    last_timestamp: Option<DateTime<Utc>>,
    record_count: usize,
}

impl StoreWriter {
    /// Open the store at `path`, creating it with a header row if absent.
    pub fn open_or_create(path: impl Into<PathBuf>) -> Result<Self> {
        let store = MetricsStore::new(path);

        let has_content = store.exists()
            && fs::metadata(store.path())
                .map_err(|source| store.io_err(source))?
                .len()
                > 0;

        if has_content {
            repair_torn_tail(&store)?;
        }

        // Older layouts are readable but never appended to
        match store.columns()? {
            None => create_with_header(&store)?,
            Some(columns) => {
                if columns.iter().map(String::as_str).ne(STORE_COLUMNS.iter().copied()) {
                    return Err(store.header_err(columns.iter().map(String::as_str)).into());
                }
            }
        }

        let history = store.load_all()?;
        let file = OpenOptions::new()
            .append(true)
            .open(store.path())
            .map_err(|source| store.io_err(source))?;
        let committed_len = file
            .metadata()
            .map_err(|source| store.io_err(source))?
            .len();

        info!(
            path = %store.path().display(),
            records = history.len(),
            "metrics store ready"
        );

        Ok(Self {
            last_timestamp: history.last().map(|r| r.timestamp),
            record_count: history.len(),
            store,
            file,
            committed_len,
        })
    }

    /// Durably append one record.
    pub fn append(&mut self, record: &MetricRecord) -> Result<()> {
        let row = encode_row(record).map_err(|source| self.store.csv_err(source))?;

        if let Err(source) = self
            .file
            .write_all(&row)
            .and_then(|_| self.file.sync_data())
        {
            self.rollback();
            return Err(self.store.io_err(source).into());
        }

        self.committed_len += row.len() as u64;
        self.record_count += 1;
        self.last_timestamp = Some(
            self.last_timestamp
                .map_or(record.timestamp, |last| last.max(record.timestamp)),
        );
        debug!(records = self.record_count, "appended record");
        Ok(())
    }

    /// Drop whatever part of a failed row made it to disk.
    fn rollback(&mut self) {
        if let Err(truncate_err) = self
            .file
            .set_len(self.committed_len)
            .and_then(|_| self.file.sync_data())
        {
            warn!(
                path = %self.store.path().display(),
                ?truncate_err,
                "failed to roll back partial row"
            );
        }
    }

    pub fn reader(&self) -> MetricsStore {
        self.store.clone()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }
}

/// Append side of the store, as driven by the orchestrator.
#[automock]
pub trait RecordSink: Send {
    fn append(&mut self, record: &MetricRecord) -> Result<()>;

    /// Latest timestamp persisted so far.
    fn last_timestamp(&self) -> Option<DateTime<Utc>>;

    fn reader(&self) -> MetricsStore;
}

impl RecordSink for StoreWriter {
    fn append(&mut self, record: &MetricRecord) -> Result<()> {
        StoreWriter::append(self, record)
    }

    fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        StoreWriter::last_timestamp(self)
    }

    fn reader(&self) -> MetricsStore {
        StoreWriter::reader(self)
    }
}

fn encode_row(record: &MetricRecord) -> std::result::Result<Vec<u8>, csv::Error> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.serialize(record)?;
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

fn complete_rows(bytes: &[u8]) -> &[u8] {
    match bytes.iter().rposition(|b| *b == b'\n') {
        Some(pos) => &bytes[..=pos],
        None => &[],
    }
}

/// Write the header to a temp file and rename it into place so readers never
/// see a store without its header.
fn create_with_header(store: &MetricsStore) -> Result<()> {
    let path = store.path();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| store.io_err(source))?;
    }

    let mut writer = WriterBuilder::new()
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer
        .write_record(STORE_COLUMNS)
        .map_err(|source| store.csv_err(source))?;
    let header = writer
        .into_inner()
        .map_err(|e| store.io_err(e.into_error()))?;

    let temp_path = path.with_extension("csv.tmp");
    {
        let mut temp_file = File::create(&temp_path).map_err(|source| store.io_err(source))?;
        temp_file
            .write_all(&header)
            .and_then(|_| temp_file.sync_all())
            .map_err(|source| store.io_err(source))?;
    }
    fs::rename(&temp_path, path).map_err(|source| store.io_err(source))?;

    info!(path = %path.display(), "created metrics store");
    Ok(())
}

/// Truncate an unterminated final row left behind by an interrupted write, so
/// the next append starts on a fresh line.
fn repair_torn_tail(store: &MetricsStore) -> Result<()> {
    let bytes = fs::read(store.path()).map_err(|source| store.io_err(source))?;
    let keep = complete_rows(&bytes).len();
    if keep == bytes.len() {
        return Ok(());
    }

    warn!(
        path = %store.path().display(),
        dropped_bytes = bytes.len() - keep,
        "discarding incomplete trailing row"
    );
    let file = OpenOptions::new()
        .write(true)
        .open(store.path())
        .map_err(|source| store.io_err(source))?;
    file.set_len(keep as u64)
        .and_then(|_| file.sync_all())
        .map_err(|source| store.io_err(source))?;
    Ok(())
}
