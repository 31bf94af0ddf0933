//! Per-step records and the finished run result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::{Action, InternalState};
use crate::metrics::StrategyMetrics;

/// An action rejected during a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub entity_name: String,
    pub action: Action,
    pub reason: String,
    /// Later actions of the same step that were not attempted.
    pub skipped: usize,
}

/// Snapshot of every entity after one observation was processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub timestamp: DateTime<Utc>,
    pub internal_states: BTreeMap<String, InternalState>,
    pub balances: BTreeMap<String, f64>,
    pub portfolio_value: f64,
    #[serde(default)]
    pub failures: Vec<ActionFailure>,
}

impl StepRecord {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyResult {
    pub records: Vec<StepRecord>,
    pub metrics: StrategyMetrics,
}

impl StrategyResult {
    pub fn new(records: Vec<StepRecord>) -> Self {
        let metrics = StrategyMetrics::from_records(&records);
        Self { records, metrics }
    }

    pub fn equity_curve(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.portfolio_value).collect()
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.records.iter().map(|r| r.timestamp).collect()
    }

    pub fn failed_actions(&self) -> usize {
        self.records.iter().map(|r| r.failures.len()).sum()
    }

    pub fn failed_steps(&self) -> usize {
        self.records.iter().filter(|r| r.has_failures()).count()
    }
}
