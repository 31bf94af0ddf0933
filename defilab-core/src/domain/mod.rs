//! Domain types for defilab

pub mod action;
pub mod observation;
pub mod state;

pub use action::{
    Action, ActionEffect, ActionKind, ActionToTake, Amount, AmountRef, Measure, ResolvedAction,
};
pub use observation::{validate_sequence, Observation};
pub use state::{
    EntityKind, GlobalState, InternalState, LendingGlobalState, LendingInternalState,
    PerpGlobalState, PerpInternalState, PerpPosition, PoolGlobalState, PoolInternalState,
    SpotGlobalState, SpotInternalState,
};

/// Registered entity name.
pub type EntityName = String;
