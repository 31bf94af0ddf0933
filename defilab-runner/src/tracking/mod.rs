//! Experiment tracking sinks.
//!
//! One completed grid point becomes one tracked run: params at start,
//! scalar metrics, zero or more artifacts, then a terminal status. Sinks are
//! shared across worker threads, so every method takes `&self`.

pub mod local;
pub mod memory;
pub mod mlflow;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use defilab_core::strategy::ParamPoint;

use crate::config::TrackingConfig;

pub use local::LocalSink;
pub use memory::{MemorySink, TrackedRun};
pub use mlflow::MlflowSink;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("tracking I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("tracking serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("tracking request failed: {0}")]
    Http(String),
    #[error("tracking server rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("unknown tracking run '{0}'")]
    UnknownRun(String),
    #[error("tracking sink state poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
        }
    }
}

pub trait TrackingSink: Send + Sync {
    /// Opens a run and returns the sink's id for it.
    fn start_run(
        &self,
        experiment: &str,
        run_name: &str,
        params: &ParamPoint,
    ) -> Result<String, SinkError>;

    fn log_metrics(&self, run_id: &str, metrics: &BTreeMap<String, f64>)
        -> Result<(), SinkError>;

    fn log_artifact(&self, run_id: &str, name: &str, bytes: &[u8]) -> Result<(), SinkError>;

    fn end_run(&self, run_id: &str, status: RunStatus) -> Result<(), SinkError>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl TrackingSink for NullSink {
    fn start_run(&self, _: &str, run_name: &str, _: &ParamPoint) -> Result<String, SinkError> {
        Ok(run_name.to_string())
    }

    fn log_metrics(&self, _: &str, _: &BTreeMap<String, f64>) -> Result<(), SinkError> {
        Ok(())
    }

    fn log_artifact(&self, _: &str, _: &str, _: &[u8]) -> Result<(), SinkError> {
        Ok(())
    }

    fn end_run(&self, _: &str, _: RunStatus) -> Result<(), SinkError> {
        Ok(())
    }
}

pub fn sink_from_config(config: &TrackingConfig) -> Result<Arc<dyn TrackingSink>, SinkError> {
    Ok(match config {
        TrackingConfig::None => Arc::new(NullSink),
        TrackingConfig::Local { path } => Arc::new(LocalSink::new(path.clone())?),
        TrackingConfig::Mlflow { uri, timeout_secs } => Arc::new(MlflowSink::new(
            uri.clone(),
            Duration::from_secs(*timeout_secs),
        )?),
    })
}
