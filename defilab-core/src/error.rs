//! Error taxonomy for the simulation core.
//!
//! - `DomainError`: an action was rejected by an entity. Recorded against the
//!   step; the run continues unless the failure policy escalates.
//! - `DataError`: the observation feed is unusable. Fatal to the run.
//! - `ConfigError`: parameters or registrations are invalid. Rejected before
//!   any step executes.
//! - `EngineError`: why a run ended in `Failed`.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{ActionKind, EntityKind};
use crate::storage::StorageError;
use crate::strategy::Phase;

/// An entity refused to execute an action.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    #[error("insufficient {asset}: requested {requested}, available {available}")]
    InsufficientBalance {
        asset: &'static str,
        requested: f64,
        available: f64,
    },
    #[error("leverage {leverage:.4} outside bound (max {max:.4})")]
    LeverageOutOfBounds { leverage: f64, max: f64 },
    #[error("loan-to-value {ltv:.4} exceeds maximum {max:.4}")]
    LtvExceeded { ltv: f64, max: f64 },
    #[error("maintenance margin {required:.4} not covered by remaining balance {remaining:.4}")]
    MaintenanceMargin { required: f64, remaining: f64 },
    #[error("action '{action}' is not supported by {kind} entities")]
    UnsupportedAction { kind: EntityKind, action: ActionKind },
    #[error("no entity registered under '{0}'")]
    UnknownEntity(String),
    #[error("invalid amount {amount} for '{action}'")]
    InvalidAmount { action: ActionKind, amount: f64 },
    #[error("no collateral deposited")]
    NoCollateral,
    #[error("no market price observed yet")]
    NoMarketPrice,
    #[error("a position is already open")]
    PositionAlreadyOpen,
    #[error("no open position")]
    NoOpenPosition,
}

/// The observation feed cannot be simulated.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("observation sequence is empty")]
    EmptyObservations,
    #[error("timestamp regression at index {index}: {current} after {previous}")]
    TimestampRegression {
        index: usize,
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },
    #[error("observation at {timestamp} carries state for unregistered entity '{entity}'")]
    UnknownEntity {
        entity: String,
        timestamp: DateTime<Utc>,
    },
    #[error("entity '{entity}' expects {expected} state, got {found}")]
    StateKindMismatch {
        entity: String,
        expected: EntityKind,
        found: EntityKind,
    },
    #[error("field '{field}' of entity '{entity}' is invalid: {value}")]
    InvalidField {
        entity: String,
        field: &'static str,
        value: f64,
    },
}

/// Invalid parameters, grid points, or entity registrations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("missing parameter '{0}'")]
    MissingParam(String),
    #[error("parameter '{name}' = {value} out of range: {reason}")]
    OutOfRange {
        name: String,
        value: f64,
        reason: String,
    },
    #[error("parameter ordering violated: {0}")]
    Ordering(String),
    #[error("entity '{0}' is already registered")]
    DuplicateEntity(String),
    #[error("invalid grid: {0}")]
    InvalidGrid(String),
}

/// Why a simulation run failed.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("data error: {0}")]
    Data(#[from] DataError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("set-up action failed: {0}")]
    SetUp(#[source] DomainError),
    #[error("strategy instance already ran; build a fresh instance per run")]
    AlreadyRun,
    #[error("cannot {operation} while in phase {phase:?}")]
    InvalidPhase {
        phase: Phase,
        operation: &'static str,
    },
    #[error("aborted after {count} consecutive failing steps; last failure: {last}")]
    DomainEscalation { count: usize, last: String },
    #[error("decision hook failed: {0}")]
    Decision(String),
    #[error("run cancelled: {0}")]
    Cancelled(String),
    #[error("internal error: {0}")]
    Internal(String),
}
