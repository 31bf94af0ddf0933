//! Experiment configuration, parsed from TOML.
//!
//! ```toml
//! name = "basis-leverage"
//! parallel = true
//! timeout_secs = 60
//! failure_policy = { abort_after_consecutive = 5 }
//!
//! [grid.axes]
//! MIN_LEVERAGE = [1.0, 2.0]
//! TARGET_LEVERAGE = { start = 2.0, end = 4.0, step = 1.0 }
//! MAX_LEVERAGE = { start = 4.0, end = 8.0, count = 3 }
//!
//! [[grid.constraints]]
//! strictly_increasing = ["MIN_LEVERAGE", "TARGET_LEVERAGE", "MAX_LEVERAGE"]
//!
//! [windows]
//! size = 720
//! step = 168
//!
//! [tracking]
//! kind = "local"
//! path = "runs"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use defilab_core::strategy::FailurePolicy;

/// Errors reading or validating an experiment file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level experiment description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    /// Wall-clock limit for each grid point.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub grid: GridSpec,
    #[serde(default)]
    pub windows: Option<WindowSpec>,
    #[serde(default)]
    pub tracking: TrackingConfig,
}

fn default_parallel() -> bool {
    true
}

impl ExperimentConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// A config with no axes: one grid point, run sequentially.
    pub fn single(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parallel: false,
            timeout_secs: None,
            failure_policy: FailurePolicy::Continue,
            grid: GridSpec::default(),
            windows: None,
            tracking: TrackingConfig::None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("experiment name is empty".into()));
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::Invalid("timeout_secs must be > 0".into()));
        }
        if let FailurePolicy::AbortAfterConsecutive(0) = self.failure_policy {
            return Err(ConfigError::Invalid(
                "abort_after_consecutive must be >= 1".into(),
            ));
        }
        if let Some(windows) = &self.windows {
            if windows.size < 2 || windows.step == 0 {
                return Err(ConfigError::Invalid(format!(
                    "windows need size >= 2 and step >= 1, got size={} step={}",
                    windows.size, windows.step
                )));
            }
        }
        for (name, axis) in &self.grid.axes {
            axis.values().map_err(|e| match e {
                ConfigError::Invalid(msg) => ConfigError::Invalid(format!("axis {name}: {msg}")),
                other => other,
            })?;
        }
        for constraint in &self.grid.constraints {
            for name in constraint.names() {
                if !self.grid.axes.contains_key(name) {
                    return Err(ConfigError::Invalid(format!(
                        "constraint names unknown axis '{name}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

// ─── Grid ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    #[serde(default)]
    pub axes: BTreeMap<String, AxisSpec>,
    #[serde(default)]
    pub constraints: Vec<GridConstraint>,
}

/// One hyperparameter axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AxisSpec {
    Values(Vec<f64>),
    /// Inclusive of `end` when it lands on a step.
    Range { start: f64, end: f64, step: f64 },
    Linspace { start: f64, end: f64, count: usize },
}

impl AxisSpec {
    pub fn values(&self) -> Result<Vec<f64>, ConfigError> {
        let values = match *self {
            AxisSpec::Values(ref v) => v.clone(),
            AxisSpec::Range { start, end, step } => {
                if !(step > 0.0) || !start.is_finite() || !end.is_finite() || end < start {
                    return Err(ConfigError::Invalid(format!(
                        "range needs start <= end and step > 0, got {start}..{end} by {step}"
                    )));
                }
                let n = ((end - start) / step + 1e-9).floor() as usize;
                (0..=n).map(|i| start + i as f64 * step).collect()
            }
            AxisSpec::Linspace { start, end, count } => {
                if count == 0 || !start.is_finite() || !end.is_finite() {
                    return Err(ConfigError::Invalid(format!(
                        "linspace needs finite bounds and count >= 1, got {start}..{end} x{count}"
                    )));
                }
                if count == 1 {
                    vec![start]
                } else {
                    let width = (end - start) / (count - 1) as f64;
                    (0..count).map(|i| start + i as f64 * width).collect()
                }
            }
        };
        if values.is_empty() {
            return Err(ConfigError::Invalid("axis has no values".into()));
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(ConfigError::Invalid(format!("non-finite value {bad}")));
        }
        Ok(values)
    }
}

/// Cross-axis filters applied while expanding the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridConstraint {
    StrictlyIncreasing(Vec<String>),
    NonDecreasing(Vec<String>),
}

impl GridConstraint {
    pub fn names(&self) -> &[String] {
        match self {
            GridConstraint::StrictlyIncreasing(names) | GridConstraint::NonDecreasing(names) => {
                names
            }
        }
    }
}

// ─── Data modes ─────────────────────────────────────────────────────

/// Sliding windows over the backtest sequence, in observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub size: usize,
    pub step: usize,
}

// ─── Tracking ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackingConfig {
    #[default]
    None,
    Local {
        path: PathBuf,
    },
    Mlflow {
        uri: String,
        #[serde(default = "default_mlflow_timeout")]
        timeout_secs: u64,
    },
}

fn default_mlflow_timeout() -> u64 {
    10
}
