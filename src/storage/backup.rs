use super::{StoreError, io_err};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Timestamped copies of a dataset file, keeping the newest `retention`.
#[derive(Debug, Clone)]
pub struct BackupPolicy {
    dir: PathBuf,
    retention: usize,
}

impl BackupPolicy {
    pub fn new(dir: &Path, retention: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            retention,
        }
    }

    /// Copy `source` to `<dir>/<stem>_<timestamp>.csv`, then prune older copies
    /// of the same stem. A missing source is not an error; nothing is written.
    pub fn snapshot(&self, source: &Path) -> Result<Option<PathBuf>, StoreError> {
        if !source.exists() {
            return Ok(None);
        }
        let stem = dataset_stem(source);

        std::fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let target = self.dir.join(format!(
            "{}_{}.csv",
            stem,
            Local::now().format("%Y%m%d_%H%M%S_%6f")
        ));
        std::fs::copy(source, &target).map_err(io_err(&target))?;
        debug!("Backup written to {}", target.display());

        self.prune(&stem)?;
        Ok(Some(target))
    }

    /// Delete all but the newest `retention` backups of `stem`, newest judged
    /// by modification time then file name.
    fn prune(&self, stem: &str) -> Result<usize, StoreError> {
        let mut backups = self.list(stem)?;
        if backups.len() <= self.retention {
            return Ok(0);
        }

        backups.sort_by(|a, b| b.cmp(a));
        let mut removed = 0;
        for (_, path) in backups.into_iter().skip(self.retention) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Could not remove old backup {}: {}", path.display(), e),
            }
        }
        debug!("Pruned {} old {} backups", removed, stem);
        Ok(removed)
    }

    /// Backups of `stem` with their modification times.
    pub fn list(&self, stem: &str) -> Result<Vec<(SystemTime, PathBuf)>, StoreError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&self.dir)(e)),
        };

        let prefix = format!("{stem}_");
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.dir))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !(name.starts_with(&prefix) && name.ends_with(".csv")) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((modified, entry.path()));
        }
        Ok(out)
    }
}

fn dataset_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string())
}
