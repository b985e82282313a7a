//! CSV-backed datasets.
//!
//! Each record kind lives in one file that is always a complete,
//! deduplicated snapshot: `append` loads the file, merges the batch, and
//! replaces the file through a temp-file rename. Writers to one dataset are
//! serialised by a per-dataset lock; readers never lock and observe either
//! the previous or the new snapshot.

pub mod backup;
pub mod query;

use crate::config::StorageConfig;
use crate::models::{PriceRecord, ReportRecord};
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs::File;
use std::hash::Hash;
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

use self::backup::BackupPolicy;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed dataset {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("no rows match the export filter")]
    NoRows,
}

pub(crate) fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io { path: path.to_path_buf(), source }
}

fn csv_err(path: &Path) -> impl FnOnce(csv::Error) -> StoreError + '_ {
    move |source| StoreError::Csv { path: path.to_path_buf(), source }
}

// ── Record kinds ──────────────────────────────────────────────────────────────

/// A row type that can live in a dataset file.
pub trait DatasetRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const FILE_NAME: &'static str;

    /// Minimal field combination identifying a logical record.
    type Key: Eq + Hash;

    fn natural_key(&self) -> Self::Key;

    /// Called on every row of a batch right before it is merged.
    fn stamp_saved(&mut self, _at: NaiveDateTime) {}
}

impl DatasetRecord for PriceRecord {
    const FILE_NAME: &'static str = "market_prices.csv";
    type Key = (String, String, String);

    fn natural_key(&self) -> Self::Key {
        (self.market_name.clone(), self.variety_name.clone(), self.trade_date.clone())
    }

    fn stamp_saved(&mut self, at: NaiveDateTime) {
        self.saved_at = Some(at);
    }
}

impl DatasetRecord for ReportRecord {
    const FILE_NAME: &'static str = "analysis_reports.csv";
    type Key = String;

    fn natural_key(&self) -> Self::Key {
        self.report_id.clone()
    }
}

/// Drop rows sharing a natural key, keeping the last occurrence of each.
/// Surviving rows keep their relative order.
pub fn dedup_keep_last<T: DatasetRecord>(rows: Vec<T>) -> Vec<T> {
    let mut last_seen = HashMap::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        last_seen.insert(row.natural_key(), i);
    }
    rows.into_iter()
        .enumerate()
        .filter(|(i, row)| last_seen.get(&row.natural_key()) == Some(i))
        .map(|(_, row)| row)
        .collect()
}

// ── File I/O ──────────────────────────────────────────────────────────────────

/// Read all rows. A missing or empty file is an empty dataset.
pub fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(path)(e)),
    };
    let content = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes);
    if content.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(content);
    reader
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .map_err(csv_err(path))
}

/// Write rows (BOM + header + records) to `path`, creating or truncating it.
pub fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), StoreError> {
    let file = File::create(path).map_err(io_err(path))?;
    let mut out = BufWriter::new(file);
    out.write_all(UTF8_BOM).map_err(io_err(path))?;

    let mut writer = csv::Writer::from_writer(out);
    for row in rows {
        writer.serialize(row).map_err(csv_err(path))?;
    }
    let out = writer
        .into_inner()
        .map_err(|e| io_err(path)(e.into_error()))?;
    let file = out
        .into_inner()
        .map_err(|e| io_err(path)(e.into_error()))?;
    file.sync_all().map_err(io_err(path))
}

/// Replace `path` with a snapshot of `rows` via a sibling temp file + rename.
fn replace_atomically<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), StoreError> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    if let Err(e) = write_rows(&tmp, rows) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    std::fs::rename(&tmp, path).map_err(io_err(path))
}

// ── Dataset ───────────────────────────────────────────────────────────────────

pub struct Dataset<T> {
    path: PathBuf,
    backups: BackupPolicy,
    write_lock: Mutex<()>,
    _rows: PhantomData<fn() -> T>,
}

impl<T: DatasetRecord> Dataset<T> {
    pub fn open(data_dir: &Path, backups: BackupPolicy) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir).map_err(io_err(data_dir))?;
        Ok(Self {
            path: data_dir.join(T::FILE_NAME),
            backups,
            write_lock: Mutex::new(()),
            _rows: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<T>, StoreError> {
        read_rows(&self.path)
    }

    /// Merge `batch` into the dataset (last write wins per natural key) and
    /// take a backup. Returns the number of rows handed in.
    pub fn append(&self, mut batch: Vec<T>) -> Result<usize, StoreError> {
        if batch.is_empty() {
            debug!("{}: nothing to append", T::FILE_NAME);
            return Ok(0);
        }
        let count = batch.len();

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let now = Local::now().naive_local();
        batch.iter_mut().for_each(|r| r.stamp_saved(now));

        let mut rows = self.load()?;
        let before = rows.len();
        rows.append(&mut batch);
        let rows = dedup_keep_last(rows);
        replace_atomically(&self.path, &rows)?;

        info!(
            "{}: saved {} rows ({} → {} total)",
            T::FILE_NAME,
            count,
            before,
            rows.len()
        );

        if let Err(e) = self.backups.snapshot(&self.path) {
            warn!("{}: backup after append failed: {}", T::FILE_NAME, e);
        }
        Ok(count)
    }

    /// Keep only rows matching `keep`, rewriting the snapshot. Returns rows removed.
    pub fn retain(&self, mut keep: impl FnMut(&T) -> bool) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let rows = self.load()?;
        let before = rows.len();
        let rows: Vec<T> = rows.into_iter().filter(|r| keep(r)).collect();
        let removed = before - rows.len();
        if removed > 0 {
            replace_atomically(&self.path, &rows)?;
        }
        Ok(removed)
    }

    /// Copy the current snapshot into the backup directory and apply retention.
    pub fn backup(&self) -> Result<Option<PathBuf>, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.backups.snapshot(&self.path)
    }

    /// Filter, order by `recency` descending, truncate to `limit`.
    pub fn query<K: Ord>(
        &self,
        filter: impl Fn(&T) -> bool,
        recency: impl Fn(&T) -> K,
        limit: usize,
    ) -> Result<Vec<T>, StoreError> {
        let mut rows: Vec<T> = self.load()?.into_iter().filter(|r| filter(r)).collect();
        rows.sort_by(|a, b| recency(b).cmp(&recency(a)));
        rows.truncate(limit);
        Ok(rows)
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Owns both datasets. Construct once and share behind an `Arc`.
pub struct Store {
    prices: Dataset<PriceRecord>,
    reports: Dataset<ReportRecord>,
    data_dir: PathBuf,
    export_limit: usize,
}

impl Store {
    pub fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        let policy = BackupPolicy::new(&config.backup_dir, config.backup_retention);
        Ok(Self {
            prices: Dataset::open(&config.data_dir, policy.clone())?,
            reports: Dataset::open(&config.data_dir, policy)?,
            data_dir: config.data_dir.clone(),
            export_limit: config.export_limit,
        })
    }

    pub fn prices(&self) -> &Dataset<PriceRecord> {
        &self.prices
    }

    pub fn reports(&self) -> &Dataset<ReportRecord> {
        &self.reports
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn backup_all(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut written = Vec::new();
        written.extend(self.prices.backup()?);
        written.extend(self.reports.backup()?);
        Ok(written)
    }
}
