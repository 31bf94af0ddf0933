//! Observation storage with windowed, no-lookahead reads.
//!
//! Writes are append-only and must arrive in non-decreasing timestamp order.
//! Strategies never touch a storage directly: they get a `HistoryView` that
//! clamps every read to the timestamp currently being processed.

#[cfg(feature = "duckdb")]
pub mod duckdb;
pub mod jsonl;
pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Observation;

#[cfg(feature = "duckdb")]
pub use self::duckdb::DuckDbStorage;
pub use jsonl::JsonlStorage;
pub use memory::MemoryStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("out-of-order append: {current} after {previous}")]
    OutOfOrder {
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Which slice of history to read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    All,
    /// The most recent `n` observations.
    Last(usize),
    /// Inclusive time range.
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

pub trait ObservationsStorage: Send + Sync {
    fn append(&mut self, observation: Observation) -> Result<(), StorageError>;

    /// Ordered read of `window`, restricted to observations at or before
    /// `cutoff` when given. The cutoff is applied before `Last(n)` counts.
    fn read_bounded(
        &self,
        window: &Window,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>, StorageError>;

    fn read(&self, window: &Window) -> Result<Vec<Observation>, StorageError> {
        self.read_bounded(window, None)
    }

    fn latest_timestamp(&self) -> Option<DateTime<Utc>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reject an append that would move time backwards.
pub(crate) fn check_order(
    latest: Option<DateTime<Utc>>,
    incoming: &Observation,
) -> Result<(), StorageError> {
    match latest {
        Some(previous) if incoming.timestamp < previous => Err(StorageError::OutOfOrder {
            previous,
            current: incoming.timestamp,
        }),
        _ => Ok(()),
    }
}

/// Apply a window and cutoff to an ordered sequence.
pub(crate) fn select(
    observations: impl IntoIterator<Item = Observation>,
    window: &Window,
    cutoff: Option<DateTime<Utc>>,
) -> Vec<Observation> {
    let visible = observations
        .into_iter()
        .take_while(|o| cutoff.map_or(true, |c| o.timestamp <= c));

    match window {
        Window::All => visible.collect(),
        Window::Last(n) => {
            let all: Vec<Observation> = visible.collect();
            let skip = all.len().saturating_sub(*n);
            all.into_iter().skip(skip).collect()
        }
        Window::Range { start, end } => visible
            .filter(|o| o.timestamp >= *start && o.timestamp <= *end)
            .collect(),
    }
}

/// Read-only history handle bound to the step being processed.
pub struct HistoryView<'a> {
    storage: Option<&'a dyn ObservationsStorage>,
    now: DateTime<Utc>,
}

impl<'a> HistoryView<'a> {
    pub fn new(storage: Option<&'a dyn ObservationsStorage>, now: DateTime<Utc>) -> Self {
        Self { storage, now }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn is_available(&self) -> bool {
        self.storage.is_some()
    }

    /// Read `window`, never past `now`. Without a storage the history is empty.
    pub fn read(&self, window: &Window) -> Result<Vec<Observation>, StorageError> {
        match self.storage {
            Some(storage) => storage.read_bounded(window, Some(self.now)),
            None => Ok(Vec::new()),
        }
    }
}
