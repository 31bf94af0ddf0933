//! Strategy contract and the contexts it sees.
//!
//! A strategy registers its entities once in `set_up`, then for every
//! observation returns an ordered list of actions from `predict`. It never
//! gets mutable access to entities and never sees observations later than
//! the one being processed.

pub mod params;
pub mod record;
pub mod simulation;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ActionEffect, ActionToTake, Observation};
use crate::entity::{Entity, EntityRegistry};
use crate::error::{ConfigError, DomainError, EngineError};
use crate::storage::{HistoryView, StorageError, Window};

pub use params::{ParamPoint, StrategyParams};
pub use record::{ActionFailure, StepRecord, StrategyResult};
pub use simulation::{FailurePolicy, Simulation, SimulationConfig};

/// Lifecycle of a simulation. `Finalized` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Created,
    SetUp,
    Stepping,
    Finalized,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Finalized | Phase::Failed)
    }
}

/// Decision logic driven by a `Simulation`.
pub trait Strategy: Send {
    type Params: StrategyParams;

    fn params(&self) -> &Self::Params;

    /// Register entities and perform one-time initialization.
    fn set_up(&mut self, ctx: &mut SetUpContext<'_>) -> Result<(), EngineError>;

    /// Actions for the current step, executed in the returned order.
    fn predict(&mut self, ctx: &StepContext<'_>) -> Result<Vec<ActionToTake>, EngineError>;
}

/// Handed to `Strategy::set_up`.
pub struct SetUpContext<'a> {
    registry: &'a mut EntityRegistry,
}

impl<'a> SetUpContext<'a> {
    pub(crate) fn new(registry: &'a mut EntityRegistry) -> Self {
        Self { registry }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        entity: impl Entity + 'static,
    ) -> Result<(), ConfigError> {
        self.registry.register(name, Box::new(entity))
    }

    /// Seed action before the first observation (e.g. an initial deposit).
    pub fn execute(&mut self, action: ActionToTake) -> Result<ActionEffect, DomainError> {
        self.registry.execute(&action)
    }

    pub fn registry(&self) -> &EntityRegistry {
        self.registry
    }
}

/// Read-only view handed to `Strategy::predict`.
pub struct StepContext<'a> {
    timestamp: DateTime<Utc>,
    step_index: usize,
    observation: &'a Observation,
    registry: &'a EntityRegistry,
    history: HistoryView<'a>,
}

impl<'a> StepContext<'a> {
    pub fn new(
        step_index: usize,
        observation: &'a Observation,
        registry: &'a EntityRegistry,
        history: HistoryView<'a>,
    ) -> Self {
        Self {
            timestamp: observation.timestamp,
            step_index,
            observation,
            registry,
            history,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    /// The observation being processed.
    pub fn observation(&self) -> &Observation {
        self.observation
    }

    pub fn entity(&self, name: &str) -> Option<&dyn Entity> {
        self.registry.get(name)
    }

    pub fn entity_as<T: Entity + 'static>(&self, name: &str) -> Option<&T> {
        self.registry.get_as::<T>(name)
    }

    pub fn entities(&self) -> &EntityRegistry {
        self.registry
    }

    /// Past observations, clamped to the current timestamp.
    pub fn history(&self, window: &Window) -> Result<Vec<Observation>, StorageError> {
        self.history.read(window)
    }
}

/// Typed lookup that turns a missing entity into an engine error.
pub fn expect_entity<'a, T: Entity + 'static>(
    ctx: &'a StepContext<'_>,
    name: &str,
) -> Result<&'a T, EngineError> {
    ctx.entity_as::<T>(name)
        .ok_or_else(|| EngineError::Internal(format!("entity '{name}' missing or of wrong type")))
}
