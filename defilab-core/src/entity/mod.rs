//! Entities: market-facing snapshot plus a private ledger.
//!
//! Every entity implements one `Entity` trait. Actions are validated against
//! the current `(GlobalState, InternalState)` pair and either mutate the
//! ledger and report the realized effect, or fail with a `DomainError` naming
//! the violated constraint. Execution never clamps and never calls out.

pub mod lending;
pub mod perp;
pub mod pool;
pub mod registry;
pub mod spot;

use std::any::Any;
use std::fmt;

use crate::domain::{
    ActionEffect, ActionKind, EntityKind, GlobalState, InternalState, ResolvedAction,
};
use crate::error::{DataError, DomainError};

pub use lending::LendingEntity;
pub use perp::PerpEntity;
pub use pool::PoolEntity;
pub use registry::EntityRegistry;
pub use spot::SpotEntity;

/// Shared contract for all entity kinds.
pub trait Entity: Send + Sync + fmt::Debug {
    fn kind(&self) -> EntityKind;

    fn supported_actions(&self) -> &'static [ActionKind] {
        self.kind().supported_actions()
    }

    /// Latest market snapshot, `None` before the first observation.
    fn global_state(&self) -> Option<GlobalState>;

    fn internal_state(&self) -> InternalState;

    /// Replace the snapshot and settle any per-step effects (accrual,
    /// funding, liquidation). A state of the wrong kind is rejected before
    /// anything is mutated.
    fn apply_global_state(&mut self, state: &GlobalState) -> Result<(), DataError>;

    fn execute(&mut self, action: &ResolvedAction) -> Result<ActionEffect, DomainError>;

    /// Mark-to-market value in notional.
    fn balance(&self) -> f64;

    /// Notional-side holdings.
    fn cash(&self) -> f64;

    /// Product-side holdings.
    fn product(&self) -> f64;

    fn as_any(&self) -> &dyn Any;
}

/// Common precondition for every action: the kind is accepted by this entity
/// and the amount is finite. Only a perp `open_position` takes a signed amount.
pub fn check_action(kind: EntityKind, action: &ResolvedAction) -> Result<(), DomainError> {
    if !kind.supports(action.kind) {
        return Err(DomainError::UnsupportedAction {
            kind,
            action: action.kind,
        });
    }
    let signed = kind == EntityKind::Perp && action.kind == ActionKind::OpenPosition;
    if !action.amount.is_finite() || (!signed && action.amount < 0.0) {
        return Err(DomainError::InvalidAmount {
            action: action.kind,
            amount: action.amount,
        });
    }
    Ok(())
}

/// Kind mismatch error for `apply_global_state`. The registry fills in the
/// entity name.
pub(crate) fn state_mismatch(expected: EntityKind, found: &GlobalState) -> DataError {
    DataError::StateKindMismatch {
        entity: String::new(),
        expected,
        found: found.kind(),
    }
}

pub(crate) fn insufficient(asset: &'static str, requested: f64, available: f64) -> DomainError {
    DomainError::InsufficientBalance {
        asset,
        requested,
        available,
    }
}
