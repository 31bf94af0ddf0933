//! Strategy metrics: pure functions over the recorded equity curve.
//!
//! Every metric takes the portfolio-value series (and, where time matters,
//! the matching timestamps) and returns a scalar. Nothing here looks at
//! entity internals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::strategy::StepRecord;

pub const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 60.0 * 60.0;

/// Ceiling for annualized returns. Extrapolating a few hours of gains to a
/// year overflows `f64`; every metric stays finite so records serialize.
pub const MAX_APY: f64 = 1e9;

/// Summary of one run, computed once after the last step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyMetrics {
    pub accumulated_return: f64,
    pub apy: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
}

impl StrategyMetrics {
    pub fn compute(timestamps: &[DateTime<Utc>], values: &[f64]) -> Self {
        let acc = accumulated_return(values);
        let elapsed = elapsed_seconds(timestamps);
        Self {
            accumulated_return: acc,
            apy: annualized_return(acc, elapsed),
            sharpe: sharpe_ratio(values, steps_per_year(timestamps)),
            max_drawdown: max_drawdown(values),
        }
    }

    pub fn from_records(records: &[StepRecord]) -> Self {
        let timestamps: Vec<_> = records.iter().map(|r| r.timestamp).collect();
        let values: Vec<_> = records.iter().map(|r| r.portfolio_value).collect();
        Self::compute(&timestamps, &values)
    }

    /// Metric by name, for rankings and tracking payloads.
    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "accumulated_return" => Some(self.accumulated_return),
            "apy" => Some(self.apy),
            "sharpe" => Some(self.sharpe),
            "max_drawdown" => Some(self.max_drawdown),
            _ => None,
        }
    }

    pub fn as_pairs(&self) -> [(&'static str, f64); 4] {
        [
            ("accumulated_return", self.accumulated_return),
            ("apy", self.apy),
            ("sharpe", self.sharpe),
            ("max_drawdown", self.max_drawdown),
        ]
    }
}

// ─── Individual metric functions ────────────────────────────────────

/// `V[n] / V[0] - 1`. Zero for fewer than two points or a non-positive start.
pub fn accumulated_return(values: &[f64]) -> f64 {
    match (values.first(), values.last()) {
        (Some(&first), Some(&last)) if values.len() >= 2 && first > 0.0 => last / first - 1.0,
        _ => 0.0,
    }
}

/// Compound the accumulated return over a 365-day year.
///
/// Zero when no time elapsed. A total loss (or worse) annualizes to -1.
/// Capped at `MAX_APY`.
pub fn annualized_return(accumulated: f64, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds <= 0.0 || !accumulated.is_finite() {
        return 0.0;
    }
    let growth = 1.0 + accumulated;
    if growth <= 0.0 {
        return -1.0;
    }
    (growth.powf(SECONDS_PER_YEAR / elapsed_seconds) - 1.0).min(MAX_APY)
}

/// Annualized Sharpe-style ratio of per-step returns.
///
/// `mean / std * sqrt(steps_per_year)` with sample standard deviation.
/// Returns 0.0 for zero variance or fewer than two returns.
pub fn sharpe_ratio(values: &[f64], steps_per_year: f64) -> f64 {
    let returns = step_returns(values);
    if returns.len() < 2 {
        return 0.0;
    }
    let std = std_dev(&returns);
    if std < 1e-15 {
        return 0.0;
    }
    mean_f64(&returns) / std * steps_per_year.max(0.0).sqrt()
}

/// Worst peak-to-trough decline as a fraction, always ≤ 0.
///
/// Declines from a peak at or below zero have no meaningful ratio and count
/// as a total loss (-1), so only a non-decreasing series scores 0.
pub fn max_drawdown(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mut peak = values[0];
    let mut max_dd = 0.0_f64;

    for &v in values {
        if v > peak {
            peak = v;
        }
        let dd = if peak > 0.0 {
            (v - peak) / peak
        } else if v < peak {
            -1.0
        } else {
            0.0
        };
        if dd < max_dd {
            max_dd = dd;
        }
    }
    max_dd.max(-1.0).min(0.0)
}

// ─── Helpers ────────────────────────────────────────────────────────

pub fn step_returns(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .map(|w| {
            if w[0] > 0.0 {
                (w[1] - w[0]) / w[0]
            } else {
                0.0
            }
        })
        .collect()
}

pub fn elapsed_seconds(timestamps: &[DateTime<Utc>]) -> f64 {
    match (timestamps.first(), timestamps.last()) {
        (Some(first), Some(last)) => (*last - *first).num_milliseconds() as f64 / 1_000.0,
        _ => 0.0,
    }
}

/// Steps per 365-day year implied by the mean spacing of `timestamps`.
pub fn steps_per_year(timestamps: &[DateTime<Utc>]) -> f64 {
    if timestamps.len() < 2 {
        return 0.0;
    }
    let mean_step = elapsed_seconds(timestamps) / (timestamps.len() - 1) as f64;
    if mean_step <= 0.0 {
        return 0.0;
    }
    SECONDS_PER_YEAR / mean_step
}

pub fn mean_f64(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = mean_f64(values);
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}
