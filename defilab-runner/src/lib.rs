//! defilab runner: experiment orchestration on top of `defilab-core`.
//!
//! This crate provides:
//! - TOML experiment configs and hyperparameter grids
//! - The grid-search pipeline (backtest, trajectories, sliding windows)
//! - Tracking sinks (in-memory, local directory, MLflow)
//! - Step-record artifacts (CSV, Parquet)
//! - A remote decision hook and the agent strategy built on it

pub mod artifact;
pub mod config;
pub mod grid;
pub mod logging;
pub mod pipeline;
pub mod remote;
pub mod result;
pub mod tracking;

pub use config::{
    AxisSpec, ConfigError, ExperimentConfig, GridConstraint, GridSpec, TrackingConfig, WindowSpec,
};
pub use grid::ParamGrid;
pub use logging::init_tracing;
pub use pipeline::{window_slices, ExperimentData, Pipeline, PipelineError, StorageFactory};
pub use remote::{
    AgentParams, AgentStrategy, DecisionRequest, DecisionSource, RemoteDecisionClient, RemoteError,
};
pub use result::{
    DistributionSummary, FailedRun, FailureKind, MetricsDistribution, PipelineReport,
    RankingMetric, RunRecord,
};
pub use tracking::{
    sink_from_config, LocalSink, MemorySink, MlflowSink, NullSink, RunStatus, SinkError,
    TrackingSink,
};
