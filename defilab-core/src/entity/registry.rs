//! Name → entity registry owned by a single simulation run.

use std::collections::BTreeMap;

use super::Entity;
use crate::domain::{
    ActionEffect, ActionToTake, Amount, InternalState, Measure, Observation, ResolvedAction,
};
use crate::error::{ConfigError, DataError, DomainError};

/// Registered entities keyed by name. `BTreeMap` keeps snapshot and
/// portfolio iteration order deterministic.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<String, Box<dyn Entity>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        entity: Box<dyn Entity>,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if self.entities.contains_key(&name) {
            return Err(ConfigError::DuplicateEntity(name));
        }
        self.entities.insert(name, entity);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Entity> {
        self.entities.get(name).map(|e| e.as_ref())
    }

    /// Typed access to a registered entity.
    pub fn get_as<T: Entity + 'static>(&self, name: &str) -> Option<&T> {
        self.get(name).and_then(|e| e.as_any().downcast_ref::<T>())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn Entity)> {
        self.entities.iter().map(|(n, e)| (n.as_str(), e.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Evaluate an amount against current ledgers.
    pub fn resolve(&self, amount: &Amount) -> Result<f64, DomainError> {
        match amount {
            Amount::Fixed(value) => Ok(*value),
            Amount::Deferred(r) => {
                let entity = self
                    .get(&r.entity)
                    .ok_or_else(|| DomainError::UnknownEntity(r.entity.clone()))?;
                let base = match r.measure {
                    Measure::Cash => entity.cash(),
                    Measure::Product => entity.product(),
                    Measure::Balance => entity.balance(),
                };
                Ok(base * r.scale)
            }
        }
    }

    /// Route an action to its entity. Unknown names and kinds the target
    /// does not accept are rejected here, before the entity sees them.
    pub fn execute(&mut self, to_take: &ActionToTake) -> Result<ActionEffect, DomainError> {
        let kind = self
            .get(&to_take.entity_name)
            .map(|e| e.kind())
            .ok_or_else(|| DomainError::UnknownEntity(to_take.entity_name.clone()))?;
        let action_kind = to_take.action.kind();
        if !kind.supports(action_kind) {
            return Err(DomainError::UnsupportedAction {
                kind,
                action: action_kind,
            });
        }

        let amount = self.resolve(to_take.action.amount())?;
        let resolved = ResolvedAction::new(action_kind, amount);
        match self.entities.get_mut(&to_take.entity_name) {
            Some(entity) => entity.execute(&resolved),
            None => Err(DomainError::UnknownEntity(to_take.entity_name.clone())),
        }
    }

    /// Push every state in the observation to its entity.
    ///
    /// All states are checked first (registered name, matching kind, valid
    /// fields) so a bad observation leaves every entity untouched. Entities
    /// absent from the observation keep their previous snapshot.
    pub fn apply_observation(&mut self, observation: &Observation) -> Result<(), DataError> {
        for (name, state) in &observation.states {
            let entity = self.get(name).ok_or_else(|| DataError::UnknownEntity {
                entity: name.clone(),
                timestamp: observation.timestamp,
            })?;
            if entity.kind() != state.kind() {
                return Err(DataError::StateKindMismatch {
                    entity: name.clone(),
                    expected: entity.kind(),
                    found: state.kind(),
                });
            }
            state.validate(name)?;
        }

        for (name, state) in &observation.states {
            if let Some(entity) = self.entities.get_mut(name) {
                entity
                    .apply_global_state(state)
                    .map_err(|err| with_entity(err, name))?;
            }
        }
        Ok(())
    }

    pub fn internal_states(&self) -> BTreeMap<String, InternalState> {
        self.entities
            .iter()
            .map(|(n, e)| (n.clone(), e.internal_state()))
            .collect()
    }

    pub fn balances(&self) -> BTreeMap<String, f64> {
        self.entities
            .iter()
            .map(|(n, e)| (n.clone(), e.balance()))
            .collect()
    }

    /// Sum of mark-to-market balances.
    pub fn portfolio_value(&self) -> f64 {
        self.entities.values().map(|e| e.balance()).sum()
    }
}

fn with_entity(err: DataError, name: &str) -> DataError {
    match err {
        DataError::StateKindMismatch {
            expected, found, ..
        } => DataError::StateKindMismatch {
            entity: name.to_string(),
            expected,
            found,
        },
        other => other,
    }
}
