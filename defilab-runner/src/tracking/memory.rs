use std::collections::BTreeMap;
use std::sync::Mutex;

use defilab_core::strategy::ParamPoint;

use super::{RunStatus, SinkError, TrackingSink};

/// A run as captured by `MemorySink`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrackedRun {
    pub experiment: String,
    pub name: String,
    pub params: ParamPoint,
    pub metrics: BTreeMap<String, f64>,
    pub artifacts: BTreeMap<String, Vec<u8>>,
    pub status: Option<RunStatus>,
}

/// Keeps every run in memory. Ids are start-order indices.
#[derive(Debug, Default)]
pub struct MemorySink {
    runs: Mutex<Vec<TrackedRun>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<TrackedRun> {
        self.runs
            .lock()
            .map(|runs| runs.clone())
            .unwrap_or_default()
    }

    pub fn find(&self, name: &str) -> Option<TrackedRun> {
        self.runs().into_iter().find(|r| r.name == name)
    }

    fn with_run<T>(
        &self,
        run_id: &str,
        f: impl FnOnce(&mut TrackedRun) -> T,
    ) -> Result<T, SinkError> {
        let mut runs = self
            .runs
            .lock()
            .map_err(|_| SinkError::Poisoned)?;
        let run = run_id
            .parse::<usize>()
            .ok()
            .and_then(|i| runs.get_mut(i))
            .ok_or_else(|| SinkError::UnknownRun(run_id.to_string()))?;
        Ok(f(run))
    }
}

impl TrackingSink for MemorySink {
    fn start_run(
        &self,
        experiment: &str,
        run_name: &str,
        params: &ParamPoint,
    ) -> Result<String, SinkError> {
        let mut runs = self
            .runs
            .lock()
            .map_err(|_| SinkError::Poisoned)?;
        runs.push(TrackedRun {
            experiment: experiment.to_string(),
            name: run_name.to_string(),
            params: params.clone(),
            ..TrackedRun::default()
        });
        Ok((runs.len() - 1).to_string())
    }

    fn log_metrics(&self, run_id: &str, metrics: &BTreeMap<String, f64>) -> Result<(), SinkError> {
        self.with_run(run_id, |run| {
            run.metrics
                .extend(metrics.iter().map(|(k, v)| (k.clone(), *v)))
        })
    }

    fn log_artifact(&self, run_id: &str, name: &str, bytes: &[u8]) -> Result<(), SinkError> {
        self.with_run(run_id, |run| {
            run.artifacts.insert(name.to_string(), bytes.to_vec());
        })
    }

    fn end_run(&self, run_id: &str, status: RunStatus) -> Result<(), SinkError> {
        self.with_run(run_id, |run| run.status = Some(status))
    }
}
