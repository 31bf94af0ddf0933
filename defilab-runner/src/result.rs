//! Pipeline output: per-point records, failures, distributions, ranking.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use defilab_core::metrics::{mean_f64, StrategyMetrics};
use defilab_core::strategy::{ParamPoint, StrategyResult};
use defilab_core::EngineError;

// ─── Distribution summaries ─────────────────────────────────────────

/// Tail-aware summary of one metric across trajectories or windows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistributionSummary {
    pub mean: f64,
    pub q05: f64,
    pub q95: f64,
    /// Mean of the values strictly below `q05`; `q05` itself when none are.
    pub cvar05: f64,
}

impl DistributionSummary {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let q05 = quantile(&sorted, 0.05);
        let q95 = quantile(&sorted, 0.95);
        let tail: Vec<f64> = sorted.iter().copied().take_while(|v| *v < q05).collect();
        let cvar05 = if tail.is_empty() { q05 } else { mean_f64(&tail) };

        Some(Self {
            mean: mean_f64(values),
            q05,
            q95,
            cvar05,
        })
    }
}

/// Linear-interpolated quantile of an ascending slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Per-run metrics of a multi-sample mode plus their summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsDistribution {
    pub samples: Vec<StrategyMetrics>,
    pub accumulated_return: DistributionSummary,
    pub apy: DistributionSummary,
    pub sharpe: DistributionSummary,
    pub max_drawdown: DistributionSummary,
}

impl MetricsDistribution {
    pub fn from_samples(samples: Vec<StrategyMetrics>) -> Option<Self> {
        let column = |f: fn(&StrategyMetrics) -> f64| -> Vec<f64> { samples.iter().map(f).collect() };
        Some(Self {
            accumulated_return: DistributionSummary::from_values(&column(|m| m.accumulated_return))?,
            apy: DistributionSummary::from_values(&column(|m| m.apy))?,
            sharpe: DistributionSummary::from_values(&column(|m| m.sharpe))?,
            max_drawdown: DistributionSummary::from_values(&column(|m| m.max_drawdown))?,
            samples,
        })
    }

    pub fn mean_metrics(&self) -> StrategyMetrics {
        StrategyMetrics {
            accumulated_return: self.accumulated_return.mean,
            apy: self.apy.mean,
            sharpe: self.sharpe.mean,
            max_drawdown: self.max_drawdown.mean,
        }
    }

    /// Flat scalar names like `windows_q05_sharpe`.
    pub fn flatten(&self, prefix: &str) -> Vec<(String, f64)> {
        let mut out = Vec::with_capacity(16);
        for (metric, summary) in [
            ("accumulated_return", &self.accumulated_return),
            ("apy", &self.apy),
            ("sharpe", &self.sharpe),
            ("max_drawdown", &self.max_drawdown),
        ] {
            out.push((format!("{prefix}_mean_{metric}"), summary.mean));
            out.push((format!("{prefix}_q05_{metric}"), summary.q05));
            out.push((format!("{prefix}_q95_{metric}"), summary.q95));
            out.push((format!("{prefix}_cvar05_{metric}"), summary.cvar05));
        }
        out
    }
}

// ─── Run records ────────────────────────────────────────────────────

/// A grid point whose every sub-run finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub params: ParamPoint,
    /// Backtest metrics, else the trajectory mean, else the window mean.
    pub metrics: StrategyMetrics,
    pub backtest: Option<StrategyResult>,
    pub trajectories: Option<MetricsDistribution>,
    pub windows: Option<MetricsDistribution>,
    /// Id assigned by the tracking sink, if it accepted the run.
    pub tracking_id: Option<String>,
    /// Tracking failures. They never fail the run.
    #[serde(default)]
    pub sink_errors: Vec<String>,
}

impl RunRecord {
    /// Every scalar forwarded to the tracking sink.
    pub fn scalar_metrics(&self) -> Vec<(String, f64)> {
        let mut out: Vec<(String, f64)> = self
            .metrics
            .as_pairs()
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        if let Some(d) = &self.trajectories {
            out.extend(d.flatten("trajectories"));
        }
        if let Some(d) = &self.windows {
            out.extend(d.flatten("windows"));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Config,
    Data,
    Domain,
    Storage,
    Decision,
    Cancelled,
    Panic,
    Internal,
}

impl From<&EngineError> for FailureKind {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::Config(_) => FailureKind::Config,
            EngineError::Data(_) => FailureKind::Data,
            EngineError::SetUp(_) | EngineError::DomainEscalation { .. } => FailureKind::Domain,
            EngineError::Storage(_) => FailureKind::Storage,
            EngineError::Decision(_) => FailureKind::Decision,
            EngineError::Cancelled(_) => FailureKind::Cancelled,
            EngineError::AlreadyRun
            | EngineError::InvalidPhase { .. }
            | EngineError::Internal(_) => FailureKind::Internal,
        }
    }
}

/// A grid point that reached `Failed`. Excluded from ranking and aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRun {
    pub run_id: String,
    pub params: ParamPoint,
    pub kind: FailureKind,
    pub error: String,
}

impl FailedRun {
    pub fn from_engine(run_id: String, params: ParamPoint, err: &EngineError) -> Self {
        Self {
            run_id,
            params,
            kind: FailureKind::from(err),
            error: err.to_string(),
        }
    }
}

// ─── Ranking ────────────────────────────────────────────────────────

/// Convenience selectors for `PipelineReport::ranked_by`. All are
/// higher-is-better (drawdowns are ≤ 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RankingMetric {
    #[default]
    Sharpe,
    Apy,
    AccumulatedReturn,
    MaxDrawdown,
}

impl RankingMetric {
    pub fn value(&self, record: &RunRecord) -> f64 {
        let m = &record.metrics;
        match self {
            RankingMetric::Sharpe => m.sharpe,
            RankingMetric::Apy => m.apy,
            RankingMetric::AccumulatedReturn => m.accumulated_return,
            RankingMetric::MaxDrawdown => m.max_drawdown,
        }
    }
}

/// Everything a pipeline produced, in grid order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineReport {
    pub experiment: String,
    pub dataset_hash: String,
    pub completed: Vec<RunRecord>,
    pub failed: Vec<FailedRun>,
}

impl PipelineReport {
    pub fn total(&self) -> usize {
        self.completed.len() + self.failed.len()
    }

    pub fn get(&self, run_id: &str) -> Option<&RunRecord> {
        self.completed.iter().find(|r| r.run_id == run_id)
    }

    /// Descending by `key`; NaN sorts last, ties keep grid order.
    pub fn ranked_by<F>(&self, key: F) -> Vec<&RunRecord>
    where
        F: Fn(&RunRecord) -> f64,
    {
        let mut keyed: Vec<(f64, &RunRecord)> =
            self.completed.iter().map(|r| (key(r), r)).collect();
        keyed.sort_by(|a, b| match (a.0.is_nan(), b.0.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => b.0.total_cmp(&a.0),
        });
        keyed.into_iter().map(|(_, r)| r).collect()
    }

    /// Caller-defined ordering; stable.
    pub fn ranked_with<F>(&self, mut cmp: F) -> Vec<&RunRecord>
    where
        F: FnMut(&RunRecord, &RunRecord) -> Ordering,
    {
        let mut sorted: Vec<&RunRecord> = self.completed.iter().collect();
        sorted.sort_by(|a, b| cmp(a, b));
        sorted
    }

    pub fn best_by<F>(&self, key: F) -> Option<&RunRecord>
    where
        F: Fn(&RunRecord) -> f64,
    {
        self.ranked_by(key).into_iter().next()
    }

    pub fn top_n(&self, metric: RankingMetric, n: usize) -> Vec<&RunRecord> {
        self.ranked_by(|r| metric.value(r)).into_iter().take(n).collect()
    }

    /// Distribution of headline metrics across completed points.
    pub fn aggregate(&self) -> Option<MetricsDistribution> {
        MetricsDistribution::from_samples(self.completed.iter().map(|r| r.metrics).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, sharpe: f64) -> RunRecord {
        RunRecord {
            run_id: id.into(),
            params: ParamPoint::new(),
            metrics: StrategyMetrics {
                sharpe,
                ..StrategyMetrics::default()
            },
            backtest: None,
            trajectories: None,
            windows: None,
            tracking_id: None,
            sink_errors: Vec::new(),
        }
    }

    #[test]
    fn quantiles_interpolate_linearly() {
        let values: Vec<f64> = (0..=100).map(f64::from).collect();
        let s = DistributionSummary::from_values(&values).unwrap();
        assert!((s.q05 - 5.0).abs() < 1e-12);
        assert!((s.q95 - 95.0).abs() < 1e-12);
        assert!((s.mean - 50.0).abs() < 1e-12);
        // 0..=4 lie below q05
        assert!((s.cvar05 - 2.0).abs() < 1e-12);
    }

    #[test]
    fn cvar_falls_back_to_q05() {
        let s = DistributionSummary::from_values(&[3.0, 3.0, 3.0]).unwrap();
        assert_eq!(s.q05, 3.0);
        assert_eq!(s.cvar05, 3.0);
        let single = DistributionSummary::from_values(&[7.0]).unwrap();
        assert_eq!(single.cvar05, 7.0);
        assert!(DistributionSummary::from_values(&[]).is_none());
    }

    #[test]
    fn flatten_names() {
        let d = MetricsDistribution::from_samples(vec![StrategyMetrics::default(); 3]).unwrap();
        let names: Vec<String> = d.flatten("windows").into_iter().map(|(k, _)| k).collect();
        assert_eq!(names.len(), 16);
        assert!(names.contains(&"windows_cvar05_sharpe".to_string()));
        assert!(names.contains(&"windows_mean_max_drawdown".to_string()));
    }

    #[test]
    fn ranking_is_descending_with_nan_last() {
        let report = PipelineReport {
            completed: vec![
                record("a", 0.5),
                record("b", f64::NAN),
                record("c", 2.0),
                record("d", 0.5),
            ],
            ..PipelineReport::default()
        };
        let ids: Vec<&str> = report
            .ranked_by(|r| r.metrics.sharpe)
            .iter()
            .map(|r| r.run_id.as_str())
            .collect();
        assert_eq!(ids, vec!["c", "a", "d", "b"]);
        assert_eq!(report.best_by(|r| r.metrics.sharpe).unwrap().run_id, "c");
        assert_eq!(report.top_n(RankingMetric::Sharpe, 1)[0].run_id, "c");

        let ascending = report.ranked_with(|a, b| a.run_id.cmp(&b.run_id).reverse());
        assert_eq!(ascending[0].run_id, "d");
    }

    #[test]
    fn empty_report_has_no_aggregate() {
        let report = PipelineReport::default();
        assert!(report.aggregate().is_none());
        assert!(report.best_by(|r| r.metrics.apy).is_none());
    }
}
