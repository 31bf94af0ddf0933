//! Grid-search pipeline.
//!
//! For every grid point a fresh strategy is built and run against each data
//! mode the experiment carries:
//! 1. the backtest sequence, once
//! 2. every trajectory (e.g. Monte Carlo paths), summarized as a distribution
//! 3. sliding windows over the backtest sequence, summarized the same way
//!
//! Points are independent and may run on rayon workers. A point that errors
//! or panics becomes a `FailedRun`; it never stops the others. Completed
//! points are forwarded to the tracking sink, whose failures are logged and
//! kept on the record.

use std::any::Any;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

use defilab_core::domain::Observation;
use defilab_core::fingerprint;
use defilab_core::storage::ObservationsStorage;
use defilab_core::strategy::{
    ParamPoint, Simulation, SimulationConfig, Strategy, StrategyParams, StrategyResult,
};
use defilab_core::EngineError;

use crate::artifact;
use crate::config::{ConfigError, ExperimentConfig, WindowSpec};
use crate::grid::ParamGrid;
use crate::result::{FailedRun, FailureKind, MetricsDistribution, PipelineReport, RunRecord};
use crate::tracking::{NullSink, RunStatus, TrackingSink};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to fingerprint dataset: {0}")]
    Fingerprint(#[from] serde_json::Error),
}

/// Input sequences shared read-only by all grid points.
#[derive(Debug, Clone, Default)]
pub struct ExperimentData {
    pub backtest: Option<Vec<Observation>>,
    pub trajectories: Vec<Vec<Observation>>,
}

impl ExperimentData {
    pub fn backtest(observations: Vec<Observation>) -> Self {
        Self {
            backtest: Some(observations),
            trajectories: Vec::new(),
        }
    }

    pub fn trajectories(trajectories: Vec<Vec<Observation>>) -> Self {
        Self {
            backtest: None,
            trajectories,
        }
    }

    pub fn with_trajectories(mut self, trajectories: Vec<Vec<Observation>>) -> Self {
        self.trajectories = trajectories;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.backtest.is_none() && self.trajectories.is_empty()
    }

    /// Hash over every sequence, in order.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let mut hasher = blake3::Hasher::new();
        if let Some(obs) = &self.backtest {
            hasher.update(b"backtest:");
            hasher.update(fingerprint::dataset_hash(obs)?.as_bytes());
        }
        for (i, obs) in self.trajectories.iter().enumerate() {
            hasher.update(format!("trajectory{i}:").as_bytes());
            hasher.update(fingerprint::dataset_hash(obs)?.as_bytes());
        }
        Ok(hasher.finalize().to_hex().to_string())
    }
}

/// `observations[i..i + size]` for `i = 0, step, 2·step, …` while the window fits.
pub fn window_slices(observations: &[Observation], spec: WindowSpec) -> Vec<&[Observation]> {
    if spec.size == 0 || spec.step == 0 || observations.len() < spec.size {
        return Vec::new();
    }
    (0..=observations.len() - spec.size)
        .step_by(spec.step)
        .map(|i| &observations[i..i + spec.size])
        .collect()
}

pub type StorageFactory = Arc<dyn Fn() -> Box<dyn ObservationsStorage> + Send + Sync>;

pub struct Pipeline<S, F>
where
    S: Strategy,
    F: Fn(S::Params) -> S + Send + Sync,
{
    config: ExperimentConfig,
    grid: ParamGrid,
    factory: F,
    sink: Arc<dyn TrackingSink>,
    storage: Option<StorageFactory>,
    _strategy: PhantomData<fn() -> S>,
}

impl<S, F> Pipeline<S, F>
where
    S: Strategy,
    F: Fn(S::Params) -> S + Send + Sync,
{
    /// Grid from the config's axes; no tracking until `with_sink`.
    pub fn new(config: ExperimentConfig, factory: F) -> Result<Self, ConfigError> {
        config.validate()?;
        let grid = ParamGrid::from_spec(&config.grid)?;
        Ok(Self {
            config,
            grid,
            factory,
            sink: Arc::new(NullSink),
            storage: None,
            _strategy: PhantomData,
        })
    }

    /// Replaces the config-derived grid, e.g. to add a predicate.
    pub fn with_grid(mut self, grid: ParamGrid) -> Self {
        self.grid = grid;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn TrackingSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Gives every simulation its own fresh storage.
    pub fn with_storage(mut self, factory: StorageFactory) -> Self {
        self.storage = Some(factory);
        self
    }

    pub fn with_parallelism(mut self, parallel: bool) -> Self {
        self.config.parallel = parallel;
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn grid(&self) -> &ParamGrid {
        &self.grid
    }

    pub fn run(&self, data: &ExperimentData) -> Result<PipelineReport, PipelineError> {
        if data.is_empty() {
            return Err(ConfigError::Invalid(
                "experiment has neither backtest observations nor trajectories".into(),
            )
            .into());
        }
        if self.config.windows.is_some() && data.backtest.is_none() {
            return Err(
                ConfigError::Invalid("sliding windows need backtest observations".into()).into(),
            );
        }

        let dataset_hash = data.fingerprint()?;
        let points = self.grid.points();
        info!(
            experiment = %self.config.name,
            points = points.len(),
            parallel = self.config.parallel,
            "starting pipeline"
        );

        let outcomes: Vec<Result<RunRecord, FailedRun>> = if self.config.parallel {
            points
                .par_iter()
                .map(|p| self.run_point(p, data, &dataset_hash))
                .collect()
        } else {
            points
                .iter()
                .map(|p| self.run_point(p, data, &dataset_hash))
                .collect()
        };

        let mut report = PipelineReport {
            experiment: self.config.name.clone(),
            dataset_hash,
            completed: Vec::new(),
            failed: Vec::new(),
        };
        for outcome in outcomes {
            match outcome {
                Ok(record) => report.completed.push(record),
                Err(failed) => report.failed.push(failed),
            }
        }

        info!(
            experiment = %self.config.name,
            completed = report.completed.len(),
            failed = report.failed.len(),
            "pipeline finished"
        );
        Ok(report)
    }

    // ─── Per point ──────────────────────────────────────────────────

    fn run_point(
        &self,
        point: &ParamPoint,
        data: &ExperimentData,
        dataset_hash: &str,
    ) -> Result<RunRecord, FailedRun> {
        let run_id = fingerprint::run_id(&self.config.name, point, dataset_hash).map_err(|e| {
            FailedRun {
                run_id: String::new(),
                params: point.clone(),
                kind: FailureKind::Internal,
                error: e.to_string(),
            }
        })?;

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.simulate_point(point, data)));
        let failure = match outcome {
            Ok(Ok(mut record)) => {
                record.run_id = run_id;
                self.track_completed(&mut record);
                info!(
                    run_id = %record.run_id,
                    sharpe = record.metrics.sharpe,
                    apy = record.metrics.apy,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "grid point completed"
                );
                return Ok(record);
            }
            Ok(Err(err)) => FailedRun::from_engine(run_id, point.clone(), &err),
            Err(payload) => FailedRun {
                run_id,
                params: point.clone(),
                kind: FailureKind::Panic,
                error: panic_message(payload),
            },
        };

        warn!(
            run_id = %failure.run_id,
            kind = ?failure.kind,
            error = %failure.error,
            "grid point failed"
        );
        self.track_failed(&failure);
        Err(failure)
    }

    fn simulate_point(
        &self,
        point: &ParamPoint,
        data: &ExperimentData,
    ) -> Result<RunRecord, EngineError> {
        let params = S::Params::from_point(point)?;
        let deadline = self.config.timeout().map(|t| Instant::now() + t);

        let backtest = match &data.backtest {
            Some(obs) => Some(self.simulate(&params, obs, deadline)?),
            None => None,
        };

        let trajectories = if data.trajectories.is_empty() {
            None
        } else {
            let samples = data
                .trajectories
                .iter()
                .map(|obs| self.simulate(&params, obs, deadline).map(|r| r.metrics))
                .collect::<Result<Vec<_>, _>>()?;
            MetricsDistribution::from_samples(samples)
        };

        let windows = match (self.config.windows, &data.backtest) {
            (Some(spec), Some(obs)) => {
                let slices = window_slices(obs, spec);
                debug!(windows = slices.len(), "running sliding windows");
                let samples = slices
                    .into_iter()
                    .map(|w| self.simulate(&params, w, deadline).map(|r| r.metrics))
                    .collect::<Result<Vec<_>, _>>()?;
                MetricsDistribution::from_samples(samples)
            }
            _ => None,
        };

        let metrics = backtest
            .as_ref()
            .map(|r| r.metrics)
            .or_else(|| trajectories.as_ref().map(MetricsDistribution::mean_metrics))
            .or_else(|| windows.as_ref().map(MetricsDistribution::mean_metrics))
            .unwrap_or_default();

        Ok(RunRecord {
            run_id: String::new(),
            params: point.clone(),
            metrics,
            backtest,
            trajectories,
            windows,
            tracking_id: None,
            sink_errors: Vec::new(),
        })
    }

    fn simulate(
        &self,
        params: &S::Params,
        observations: &[Observation],
        deadline: Option<Instant>,
    ) -> Result<StrategyResult, EngineError> {
        let config = SimulationConfig {
            failure_policy: self.config.failure_policy,
            deadline,
        };
        let mut sim = Simulation::new((self.factory)(params.clone())).with_config(config);
        if let Some(make) = &self.storage {
            sim = sim.with_storage(make());
        }
        sim.run(observations)
    }

    // ─── Tracking ───────────────────────────────────────────────────

    fn track_completed(&self, record: &mut RunRecord) {
        let sink = self.sink.as_ref();
        let tracking_id = match sink.start_run(&self.config.name, &record.run_id, &record.params) {
            Ok(id) => id,
            Err(e) => {
                warn!(run_id = %record.run_id, error = %e, "tracking sink rejected run");
                record.sink_errors.push(e.to_string());
                return;
            }
        };

        let mut errors = Vec::new();
        let metrics: BTreeMap<String, f64> = record.scalar_metrics().into_iter().collect();
        if let Err(e) = sink.log_metrics(&tracking_id, &metrics) {
            errors.push(format!("metrics: {e}"));
        }

        let mut artifacts: Vec<(&str, anyhow::Result<String>)> = Vec::new();
        if let Some(backtest) = &record.backtest {
            artifacts.push((artifact::BACKTEST_CSV, artifact::steps_csv(&backtest.records)));
        }
        if let Some(dist) = &record.trajectories {
            artifacts.push((artifact::TRAJECTORIES_CSV, artifact::metrics_csv(&dist.samples)));
        }
        if let Some(dist) = &record.windows {
            artifacts.push((artifact::WINDOWS_CSV, artifact::metrics_csv(&dist.samples)));
        }
        for (name, content) in artifacts {
            let logged = content
                .map_err(|e| e.to_string())
                .and_then(|c| {
                    sink.log_artifact(&tracking_id, name, c.as_bytes())
                        .map_err(|e| e.to_string())
                });
            if let Err(e) = logged {
                errors.push(format!("{name}: {e}"));
            }
        }

        if let Err(e) = sink.end_run(&tracking_id, RunStatus::Finished) {
            errors.push(format!("end_run: {e}"));
        }

        for e in &errors {
            warn!(run_id = %record.run_id, error = %e, "tracking sink failure");
        }
        record.sink_errors.extend(errors);
        record.tracking_id = Some(tracking_id);
    }

    fn track_failed(&self, failed: &FailedRun) {
        let sink = self.sink.as_ref();
        let result = sink
            .start_run(&self.config.name, &failed.run_id, &failed.params)
            .and_then(|id| sink.end_run(&id, RunStatus::Failed));
        if let Err(e) = result {
            warn!(run_id = %failed.run_id, error = %e, "tracking sink failure");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return format!("panicked: {s}");
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return format!("panicked: {s}");
    }
    "panicked".to_string()
}
