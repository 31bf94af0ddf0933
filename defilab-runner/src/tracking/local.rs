//! Filesystem tracking: one directory per run plus an append-only index.
//!
//! ```text
//! <root>/index.jsonl
//! <root>/<experiment>/<run>/params.json
//! <root>/<experiment>/<run>/metrics.json
//! <root>/<experiment>/<run>/status
//! <root>/<experiment>/<run>/artifacts/<name>
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use defilab_core::strategy::ParamPoint;

use super::{RunStatus, SinkError, TrackingSink};

/// One line of `index.jsonl`, written when a run ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub run_id: String,
    pub experiment: String,
    pub status: RunStatus,
    pub params: ParamPoint,
    pub metrics: BTreeMap<String, f64>,
    pub finished_at: DateTime<Utc>,
}

struct OpenRun {
    experiment: String,
    dir: PathBuf,
    params: ParamPoint,
    metrics: BTreeMap<String, f64>,
}

pub struct LocalSink {
    root: PathBuf,
    open: Mutex<HashMap<String, OpenRun>>,
    index: Mutex<()>,
}

impl LocalSink {
    pub fn new(root: PathBuf) -> Result<Self, SinkError> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            open: Mutex::new(HashMap::new()),
            index: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join("index.jsonl")
    }

    /// All finished runs. Malformed lines are skipped with a warning.
    pub fn read_index(&self) -> io::Result<Vec<IndexEntry>> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = io::BufReader::new(fs::File::open(&path)?);
        let mut entries = Vec::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IndexEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(path = %path.display(), line = n + 1, error = %e, "skipping index line"),
            }
        }
        Ok(entries)
    }

    fn append_index(&self, entry: &IndexEntry) -> Result<(), SinkError> {
        let json = serde_json::to_string(entry)?;
        let _guard = self.index.lock().map_err(|_| SinkError::Poisoned)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.index_path())?;
        writeln!(file, "{json}")?;
        file.flush()?;
        Ok(())
    }
}

/// Keeps path components to a single safe segment.
fn segment(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        s => s.to_string(),
    }
}

impl TrackingSink for LocalSink {
    fn start_run(
        &self,
        experiment: &str,
        run_name: &str,
        params: &ParamPoint,
    ) -> Result<String, SinkError> {
        let run_id = format!("{}/{}", segment(experiment), segment(run_name));
        let dir = self.root.join(&run_id);
        fs::create_dir_all(dir.join("artifacts"))?;
        fs::write(dir.join("params.json"), serde_json::to_vec_pretty(params)?)?;

        let mut open = self.open.lock().map_err(|_| SinkError::Poisoned)?;
        open.insert(
            run_id.clone(),
            OpenRun {
                experiment: experiment.to_string(),
                dir,
                params: params.clone(),
                metrics: BTreeMap::new(),
            },
        );
        Ok(run_id)
    }

    fn log_metrics(&self, run_id: &str, metrics: &BTreeMap<String, f64>) -> Result<(), SinkError> {
        let mut open = self.open.lock().map_err(|_| SinkError::Poisoned)?;
        let run = open
            .get_mut(run_id)
            .ok_or_else(|| SinkError::UnknownRun(run_id.to_string()))?;
        for (key, value) in metrics {
            if value.is_finite() {
                run.metrics.insert(key.clone(), *value);
            } else {
                warn!(run_id, metric = %key, value, "dropping non-finite metric");
            }
        }
        fs::write(
            run.dir.join("metrics.json"),
            serde_json::to_vec_pretty(&run.metrics)?,
        )?;
        Ok(())
    }

    fn log_artifact(&self, run_id: &str, name: &str, bytes: &[u8]) -> Result<(), SinkError> {
        let dir = {
            let open = self.open.lock().map_err(|_| SinkError::Poisoned)?;
            open.get(run_id)
                .map(|r| r.dir.join("artifacts"))
                .ok_or_else(|| SinkError::UnknownRun(run_id.to_string()))?
        };
        fs::write(dir.join(segment(name)), bytes)?;
        Ok(())
    }

    fn end_run(&self, run_id: &str, status: RunStatus) -> Result<(), SinkError> {
        let run = {
            let mut open = self.open.lock().map_err(|_| SinkError::Poisoned)?;
            open.remove(run_id)
                .ok_or_else(|| SinkError::UnknownRun(run_id.to_string()))?
        };
        fs::write(run.dir.join("status"), status.as_str())?;
        self.append_index(&IndexEntry {
            run_id: run_id.to_string(),
            experiment: run.experiment,
            status,
            params: run.params,
            metrics: run.metrics,
            finished_at: Utc::now(),
        })
    }
}
