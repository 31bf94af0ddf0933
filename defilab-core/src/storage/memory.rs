use chrono::{DateTime, Utc};

use super::{check_order, select, ObservationsStorage, StorageError, Window};
use crate::domain::Observation;

/// In-memory storage: a vector in append order.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    observations: Vec<Observation>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            observations: Vec::with_capacity(capacity),
        }
    }
}

impl ObservationsStorage for MemoryStorage {
    fn append(&mut self, observation: Observation) -> Result<(), StorageError> {
        check_order(self.latest_timestamp(), &observation)?;
        self.observations.push(observation);
        Ok(())
    }

    fn read_bounded(
        &self,
        window: &Window,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>, StorageError> {
        Ok(select(self.observations.iter().cloned(), window, cutoff))
    }

    fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.observations.last().map(|o| o.timestamp)
    }

    fn len(&self) -> usize {
        self.observations.len()
    }
}
