//! Timestamped bundles of entity snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::state::GlobalState;
use crate::error::DataError;

/// Snapshot of every observed entity at one instant.
///
/// `states` uses `BTreeMap` so serialization (and therefore dataset hashing)
/// is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub states: BTreeMap<String, GlobalState>,
}

impl Observation {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            states: BTreeMap::new(),
        }
    }

    pub fn with_state(mut self, entity: impl Into<String>, state: GlobalState) -> Self {
        self.states.insert(entity.into(), state);
        self
    }

    pub fn state(&self, entity: &str) -> Option<&GlobalState> {
        self.states.get(entity)
    }

    /// Field-level validation of every contained state.
    pub fn validate(&self) -> Result<(), DataError> {
        for (name, state) in &self.states {
            state.validate(name)?;
        }
        Ok(())
    }
}

/// Check a whole sequence before any step executes.
///
/// Fails on an empty sequence, on the first timestamp regression, and on the
/// first invalid field. Equal consecutive timestamps are accepted.
pub fn validate_sequence(observations: &[Observation]) -> Result<(), DataError> {
    if observations.is_empty() {
        return Err(DataError::EmptyObservations);
    }
    for (index, pair) in observations.windows(2).enumerate() {
        if pair[1].timestamp < pair[0].timestamp {
            return Err(DataError::TimestampRegression {
                index: index + 1,
                previous: pair[0].timestamp,
                current: pair[1].timestamp,
            });
        }
    }
    for obs in observations {
        obs.validate()?;
    }
    Ok(())
}
