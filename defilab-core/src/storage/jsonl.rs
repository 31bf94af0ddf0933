//! Append-only JSON-lines observation log.
//!
//! One observation per line. Reopening an existing file resumes after its
//! last record, so a long-running strategy can be restarted and still re-query
//! its full history.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::{check_order, select, ObservationsStorage, StorageError, Window};
use crate::domain::Observation;

#[derive(Debug)]
pub struct JsonlStorage {
    path: PathBuf,
    len: usize,
    latest: Option<DateTime<Utc>>,
}

impl JsonlStorage {
    /// Open or create the log at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut storage = Self {
            path,
            len: 0,
            latest: None,
        };
        let existing = storage.load()?;
        storage.len = existing.len();
        storage.latest = existing.last().map(|o| o.timestamp);
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Malformed lines are errors, not skipped.
    fn load(&self) -> Result<Vec<Observation>, StorageError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }
}

impl ObservationsStorage for JsonlStorage {
    fn append(&mut self, observation: Observation) -> Result<(), StorageError> {
        check_order(self.latest, &observation)?;
        let json = serde_json::to_string(&observation)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{json}")?;
        file.flush()?;

        self.len += 1;
        self.latest = Some(observation.timestamp);
        Ok(())
    }

    fn read_bounded(
        &self,
        window: &Window,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>, StorageError> {
        Ok(select(self.load()?, window, cutoff))
    }

    fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.latest
    }

    fn len(&self) -> usize {
        self.len
    }
}
