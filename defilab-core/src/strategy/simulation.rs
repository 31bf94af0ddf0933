//! The simulation state machine: `Created → SetUp → Stepping → Finalized`,
//! with any fatal error short-circuiting to `Failed`.
//!
//! Per observation:
//! 1. push global states to entities (absent entities keep their snapshot)
//! 2. append to storage, if any, then ask the strategy for actions
//! 3. execute actions in order; a `DomainError` is recorded and ends the
//!    step's remaining actions, anything else fails the run
//! 4. append a `StepRecord`

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    ActionFailure, Phase, SetUpContext, StepContext, StepRecord, Strategy, StrategyResult,
};
use crate::domain::{validate_sequence, Observation};
use crate::entity::EntityRegistry;
use crate::error::{DataError, EngineError};
use crate::storage::{HistoryView, ObservationsStorage};

/// What recorded domain failures do to the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Domain failures never abort the run.
    #[default]
    Continue,
    /// Abort once this many consecutive steps each recorded a failure.
    AbortAfterConsecutive(usize),
}

#[derive(Debug, Clone, Default)]
pub struct SimulationConfig {
    pub failure_policy: FailurePolicy,
    /// Checked before every step. Passing it cancels the run.
    pub deadline: Option<Instant>,
}

/// Drives one strategy instance through one observation sequence.
pub struct Simulation<S: Strategy> {
    strategy: S,
    registry: EntityRegistry,
    storage: Option<Box<dyn ObservationsStorage>>,
    config: SimulationConfig,
    phase: Phase,
    records: Vec<StepRecord>,
    last_timestamp: Option<DateTime<Utc>>,
    consecutive_failing_steps: usize,
}

impl<S: Strategy> Simulation<S> {
    pub fn new(strategy: S) -> Self {
        Self {
            strategy,
            registry: EntityRegistry::new(),
            storage: None,
            config: SimulationConfig::default(),
            phase: Phase::Created,
            records: Vec::new(),
            last_timestamp: None,
            consecutive_failing_steps: 0,
        }
    }

    pub fn with_storage(mut self, storage: Box<dyn ObservationsStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_config(mut self, config: SimulationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    /// Validate the whole sequence, set up, step through it, and compute
    /// metrics. A second call fails with `AlreadyRun`.
    pub fn run(&mut self, observations: &[Observation]) -> Result<StrategyResult, EngineError> {
        if !matches!(self.phase, Phase::Created | Phase::SetUp) {
            return Err(EngineError::AlreadyRun);
        }
        let outcome = self.run_inner(observations);
        if outcome.is_err() {
            self.fail();
        }
        outcome
    }

    fn run_inner(&mut self, observations: &[Observation]) -> Result<StrategyResult, EngineError> {
        validate_sequence(observations)?;
        info!(
            observations = observations.len(),
            policy = ?self.config.failure_policy,
            "simulation started"
        );

        if self.phase == Phase::Created {
            self.set_up()?;
        }
        for observation in observations {
            self.step(observation)?;
        }
        let result = self.finalize()?;

        info!(
            steps = result.records.len(),
            failed_actions = result.failed_actions(),
            accumulated_return = result.metrics.accumulated_return,
            sharpe = result.metrics.sharpe,
            max_drawdown = result.metrics.max_drawdown,
            "simulation finished"
        );
        Ok(result)
    }

    /// `Created → SetUp`. Runs exactly once.
    pub fn set_up(&mut self) -> Result<(), EngineError> {
        if self.phase != Phase::Created {
            return Err(EngineError::InvalidPhase {
                phase: self.phase,
                operation: "set up",
            });
        }
        let mut ctx = SetUpContext::new(&mut self.registry);
        if let Err(err) = self.strategy.set_up(&mut ctx) {
            self.fail();
            return Err(err);
        }
        debug!(entities = self.registry.len(), "set up complete");
        self.phase = Phase::SetUp;
        Ok(())
    }

    /// Process one observation. Usable directly for incremental driving;
    /// timestamps must not move backwards across calls.
    pub fn step(&mut self, observation: &Observation) -> Result<&StepRecord, EngineError> {
        if !matches!(self.phase, Phase::SetUp | Phase::Stepping) {
            return Err(EngineError::InvalidPhase {
                phase: self.phase,
                operation: "step",
            });
        }
        match self.step_inner(observation) {
            Ok(()) => self
                .records
                .last()
                .ok_or_else(|| EngineError::Internal("step produced no record".into())),
            Err(err) => {
                self.fail();
                Err(err)
            }
        }
    }

    fn step_inner(&mut self, observation: &Observation) -> Result<(), EngineError> {
        if let Some(deadline) = self.config.deadline {
            if Instant::now() >= deadline {
                return Err(EngineError::Cancelled(format!(
                    "deadline passed before step {}",
                    self.records.len()
                )));
            }
        }
        if let Some(previous) = self.last_timestamp {
            if observation.timestamp < previous {
                return Err(DataError::TimestampRegression {
                    index: self.records.len(),
                    previous,
                    current: observation.timestamp,
                }
                .into());
            }
        }
        self.phase = Phase::Stepping;
        self.last_timestamp = Some(observation.timestamp);

        self.registry.apply_observation(observation)?;
        if let Some(storage) = self.storage.as_mut() {
            storage.append(observation.clone())?;
        }

        let step_index = self.records.len();
        let actions = {
            let history = HistoryView::new(self.storage.as_deref(), observation.timestamp);
            let ctx = StepContext::new(step_index, observation, &self.registry, history);
            self.strategy.predict(&ctx)?
        };

        let mut failures = Vec::new();
        for (i, to_take) in actions.iter().enumerate() {
            match self.registry.execute(to_take) {
                Ok(effect) => debug!(
                    step = step_index,
                    entity = %to_take.entity_name,
                    action = %to_take.action.kind(),
                    filled = effect.filled,
                    fee = effect.fee,
                    "action executed"
                ),
                Err(err) => {
                    let skipped = actions.len() - i - 1;
                    warn!(
                        step = step_index,
                        entity = %to_take.entity_name,
                        action = %to_take.action.kind(),
                        skipped,
                        error = %err,
                        "action failed"
                    );
                    failures.push(ActionFailure {
                        entity_name: to_take.entity_name.clone(),
                        action: to_take.action.clone(),
                        reason: err.to_string(),
                        skipped,
                    });
                    break;
                }
            }
        }

        let last_failure = failures.last().map(|f| f.reason.clone());
        self.records.push(StepRecord {
            timestamp: observation.timestamp,
            internal_states: self.registry.internal_states(),
            balances: self.registry.balances(),
            portfolio_value: self.registry.portfolio_value(),
            failures,
        });

        match last_failure {
            Some(last) => {
                self.consecutive_failing_steps += 1;
                if let FailurePolicy::AbortAfterConsecutive(limit) = self.config.failure_policy {
                    if self.consecutive_failing_steps >= limit.max(1) {
                        return Err(EngineError::DomainEscalation {
                            count: self.consecutive_failing_steps,
                            last,
                        });
                    }
                }
            }
            None => self.consecutive_failing_steps = 0,
        }
        Ok(())
    }

    /// `Stepping → Finalized`. Computes metrics over the full record.
    pub fn finalize(&mut self) -> Result<StrategyResult, EngineError> {
        if self.phase != Phase::Stepping {
            return Err(EngineError::InvalidPhase {
                phase: self.phase,
                operation: "finalize",
            });
        }
        self.phase = Phase::Finalized;
        Ok(StrategyResult::new(std::mem::take(&mut self.records)))
    }

    /// Partial records are discarded on failure.
    fn fail(&mut self) {
        self.phase = Phase::Failed;
        self.records.clear();
    }
}
