//! End-to-end tests of the simulation state machine.

use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, TimeZone, Utc};

use defilab_core::domain::{Action, ActionToTake, Amount, GlobalState, Measure, Observation};
use defilab_core::entity::{Entity, PerpEntity, PoolEntity, SpotEntity};
use defilab_core::error::{DataError, EngineError};
use defilab_core::storage::{MemoryStorage, Window};
use defilab_core::strategies::basis::{HEDGE, SPOT};
use defilab_core::strategies::{BasisParams, BasisStrategy, ThresholdParams, ThresholdStrategy};
use defilab_core::strategy::params::point;
use defilab_core::strategy::{
    FailurePolicy, ParamPoint, Phase, SetUpContext, Simulation, SimulationConfig, StepContext,
    Strategy, StrategyParams,
};
use defilab_core::synthetic::{basis_observations, spot_observations};
use defilab_core::ConfigError;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn flat(n: usize, price: f64) -> Vec<Observation> {
    spot_observations("CASH", t0(), Duration::hours(1), &vec![price; n])
}

// ─── Test strategy ──────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
struct ScriptParams {
    initial_balance: f64,
}

impl StrategyParams for ScriptParams {
    fn from_point(point: &ParamPoint) -> Result<Self, ConfigError> {
        Ok(Self {
            initial_balance: point.get("INITIAL_BALANCE").copied().unwrap_or(1_000_000.0),
        })
    }

    fn to_point(&self) -> ParamPoint {
        point([("INITIAL_BALANCE", self.initial_balance)])
    }
}

/// Single spot entity; emits the same scripted actions every step and
/// records what it could observe.
struct ScriptStrategy {
    params: ScriptParams,
    actions: Vec<ActionToTake>,
    seen: Arc<Mutex<Vec<(DateTime<Utc>, Option<DateTime<Utc>>)>>>,
    predict_calls: Arc<Mutex<usize>>,
}

impl ScriptStrategy {
    fn new(actions: Vec<ActionToTake>) -> Self {
        Self {
            params: ScriptParams {
                initial_balance: 1_000_000.0,
            },
            actions,
            seen: Arc::default(),
            predict_calls: Arc::default(),
        }
    }
}

impl Strategy for ScriptStrategy {
    type Params = ScriptParams;

    fn params(&self) -> &ScriptParams {
        &self.params
    }

    fn set_up(&mut self, ctx: &mut SetUpContext<'_>) -> Result<(), EngineError> {
        ctx.register("CASH", SpotEntity::new(0.0))?;
        ctx.execute(ActionToTake::new(
            "CASH",
            Action::deposit(self.params.initial_balance),
        ))
        .map_err(EngineError::SetUp)?;
        Ok(())
    }

    fn predict(&mut self, ctx: &StepContext<'_>) -> Result<Vec<ActionToTake>, EngineError> {
        *self.predict_calls.lock().unwrap() += 1;
        let history = ctx
            .history(&Window::All)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        let latest = history.iter().map(|o| o.timestamp).max();
        self.seen.lock().unwrap().push((ctx.timestamp(), latest));
        Ok(self.actions.clone())
    }
}

/// A spot venue plus an LP position opened with all pool cash on the first
/// step.
struct LiquidityStrategy {
    params: ScriptParams,
}

impl Strategy for LiquidityStrategy {
    type Params = ScriptParams;

    fn params(&self) -> &ScriptParams {
        &self.params
    }

    fn set_up(&mut self, ctx: &mut SetUpContext<'_>) -> Result<(), EngineError> {
        ctx.register("SPOT", SpotEntity::new(0.0))?;
        ctx.register("LP", PoolEntity::new(0.0))?;
        ctx.execute(ActionToTake::new(
            "LP",
            Action::deposit(self.params.initial_balance),
        ))
        .map_err(EngineError::SetUp)?;
        Ok(())
    }

    fn predict(&mut self, ctx: &StepContext<'_>) -> Result<Vec<ActionToTake>, EngineError> {
        if ctx.step_index() > 0 {
            return Ok(Vec::new());
        }
        Ok(vec![ActionToTake::new(
            "LP",
            Action::open_position(Amount::of("LP", Measure::Cash)),
        )])
    }
}

fn liquidity_strategy() -> LiquidityStrategy {
    LiquidityStrategy {
        params: ScriptParams {
            initial_balance: 1_000.0,
        },
    }
}

// ─── Properties ─────────────────────────────────────────────────────

#[test]
fn flat_hourly_scenario_has_zero_metrics() {
    let mut sim = Simulation::new(ScriptStrategy::new(vec![]));
    let result = sim.run(&flat(24, 1.0)).unwrap();

    assert_eq!(result.records.len(), 24);
    assert!(result
        .records
        .iter()
        .all(|r| r.portfolio_value == 1_000_000.0));
    assert_eq!(result.metrics.accumulated_return, 0.0);
    assert_eq!(result.metrics.max_drawdown, 0.0);
    assert_eq!(result.metrics.sharpe, 0.0);
    assert_eq!(sim.phase(), Phase::Finalized);
}

#[test]
fn identical_inputs_give_identical_results() {
    let prices: Vec<f64> = (0..72)
        .map(|i| 100.0 * (1.0 + 0.05 * (i as f64 / 5.0).sin()))
        .collect();
    let observations = basis_observations(SPOT, HEDGE, t0(), Duration::hours(1), &prices, 0.0001);
    let params = BasisParams::from_point(&point([
        ("MIN_LEVERAGE", 1.0),
        ("TARGET_LEVERAGE", 3.0),
        ("MAX_LEVERAGE", 5.0),
    ]))
    .unwrap();

    let a = Simulation::new(BasisStrategy::new(params.clone()))
        .run(&observations)
        .unwrap();
    let b = Simulation::new(BasisStrategy::new(params))
        .run(&observations)
        .unwrap();

    assert_eq!(a.records, b.records);
    assert_eq!(a.metrics.sharpe.to_bits(), b.metrics.sharpe.to_bits());
    assert_eq!(a.metrics.apy.to_bits(), b.metrics.apy.to_bits());
}

#[test]
fn decision_hook_never_sees_the_future() {
    let strategy = ScriptStrategy::new(vec![]);
    let seen = strategy.seen.clone();
    let mut sim = Simulation::new(strategy).with_storage(Box::new(MemoryStorage::new()));
    sim.run(&flat(12, 1.0)).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 12);
    for (now, latest) in seen.iter() {
        let latest = latest.expect("history includes the current observation");
        assert!(latest <= *now);
        assert_eq!(latest, *now);
    }
}

#[test]
fn out_of_order_sequence_fails_before_any_step() {
    let strategy = ScriptStrategy::new(vec![]);
    let calls = strategy.predict_calls.clone();
    let mut observations = flat(5, 1.0);
    observations.swap(1, 3);

    let mut sim = Simulation::new(strategy);
    let err = sim.run(&observations).unwrap_err();

    assert!(matches!(
        err,
        EngineError::Data(DataError::TimestampRegression { .. })
    ));
    assert_eq!(*calls.lock().unwrap(), 0);
    assert_eq!(sim.phase(), Phase::Failed);
    assert!(sim.records().is_empty());
}

#[test]
fn empty_sequence_is_a_data_error() {
    let mut sim = Simulation::new(ScriptStrategy::new(vec![]));
    assert!(matches!(
        sim.run(&[]),
        Err(EngineError::Data(DataError::EmptyObservations))
    ));
}

#[test]
fn second_run_is_rejected() {
    let mut sim = Simulation::new(ScriptStrategy::new(vec![]));
    sim.run(&flat(3, 1.0)).unwrap();
    assert!(matches!(sim.run(&flat(3, 1.0)), Err(EngineError::AlreadyRun)));
}

#[test]
fn unregistered_entity_in_observation_fails_run() {
    let observations = vec![Observation::new(t0())
        .with_state("CASH", GlobalState::spot(1.0))
        .with_state("GHOST", GlobalState::spot(1.0))];
    let mut sim = Simulation::new(ScriptStrategy::new(vec![]));
    assert!(matches!(
        sim.run(&observations),
        Err(EngineError::Data(DataError::UnknownEntity { .. }))
    ));
}

#[test]
fn absent_entity_keeps_its_snapshot() {
    let pool_state = GlobalState::pool(2.0, 5.0, 10_000.0);
    let mut sim = Simulation::new(liquidity_strategy());
    sim.set_up().unwrap();

    sim.step(
        &Observation::new(t0())
            .with_state("SPOT", GlobalState::spot(10.0))
            .with_state("LP", pool_state),
    )
    .unwrap();
    let lp = sim.registry().get_as::<PoolEntity>("LP").unwrap();
    assert!(lp.has_position());
    let balance_after_open = lp.balance();
    assert!((balance_after_open - 1_000.0).abs() < 1e-9);

    // LP is missing from the second observation.
    sim.step(
        &Observation::new(t0() + Duration::hours(1)).with_state("SPOT", GlobalState::spot(20.0)),
    )
    .unwrap();
    let lp = sim.registry().get_as::<PoolEntity>("LP").unwrap();
    assert_eq!(lp.global_state(), Some(pool_state));
    assert_eq!(lp.balance(), balance_after_open);
    assert_eq!(lp.cash(), 0.0, "fees accrue only when the pool reports");
    assert_eq!(
        sim.registry().get("SPOT").unwrap().global_state(),
        Some(GlobalState::spot(20.0))
    );
    assert_eq!(sim.records()[1].balances["LP"], balance_after_open);

    // Once it reports again the position reprices: value = 2·L·√p.
    sim.step(
        &Observation::new(t0() + Duration::hours(2))
            .with_state("LP", GlobalState::pool(8.0, 0.0, 10_000.0)),
    )
    .unwrap();
    let lp = sim.registry().get_as::<PoolEntity>("LP").unwrap();
    assert!((lp.balance() - 2_000.0).abs() < 1e-9);
}

#[test]
fn pool_position_runs_end_to_end() {
    let prices = [2.0, 2.5, 3.0, 2.0, 1.5, 2.0];
    let observations: Vec<Observation> = prices
        .iter()
        .enumerate()
        .map(|(i, p)| {
            Observation::new(t0() + Duration::hours(i as i64))
                .with_state("SPOT", GlobalState::spot(*p))
                .with_state("LP", GlobalState::pool(*p, 1.0, 1_000.0))
        })
        .collect();

    let result = Simulation::new(liquidity_strategy())
        .run(&observations)
        .unwrap();
    assert_eq!(result.failed_actions(), 0);
    assert_eq!(result.records.len(), prices.len());
    // Price returns to the entry, so only the fee share is gained.
    let last = result.records.last().unwrap();
    assert!(last.portfolio_value > 1_000.0);
    assert!(result.metrics.max_drawdown < 0.0);
}

#[test]
fn domain_failure_is_recorded_and_run_continues() {
    let actions = vec![
        ActionToTake::new("CASH", Action::withdraw(2_000_000.0)),
        ActionToTake::new("CASH", Action::withdraw(1.0)),
    ];
    let mut sim = Simulation::new(ScriptStrategy::new(actions));
    let result = sim.run(&flat(4, 1.0)).unwrap();

    assert_eq!(result.records.len(), 4);
    assert_eq!(result.failed_steps(), 4);
    let failure = &result.records[0].failures[0];
    assert_eq!(failure.entity_name, "CASH");
    assert_eq!(failure.skipped, 1);
    // The second withdraw was skipped, so nothing left the account.
    assert_eq!(result.records[3].portfolio_value, 1_000_000.0);
}

#[test]
fn consecutive_failures_escalate_under_abort_policy() {
    let actions = vec![ActionToTake::new("CASH", Action::buy(f64::MAX))];
    let config = SimulationConfig {
        failure_policy: FailurePolicy::AbortAfterConsecutive(3),
        deadline: None,
    };
    let mut sim = Simulation::new(ScriptStrategy::new(actions)).with_config(config);
    match sim.run(&flat(10, 1.0)) {
        Err(EngineError::DomainEscalation { count, .. }) => assert_eq!(count, 3),
        other => panic!("expected escalation, got {other:?}"),
    }
    assert_eq!(sim.phase(), Phase::Failed);
    assert!(sim.records().is_empty());
}

#[test]
fn expired_deadline_cancels_run() {
    let config = SimulationConfig {
        failure_policy: FailurePolicy::Continue,
        deadline: Instant::now().checked_sub(StdDuration::from_millis(1)),
    };
    let mut sim = Simulation::new(ScriptStrategy::new(vec![])).with_config(config);
    if sim.run(&flat(3, 1.0)).is_ok() {
        // Instant could not be moved into the past on this platform.
        return;
    }
    assert_eq!(sim.phase(), Phase::Failed);
}

#[test]
fn incremental_stepping_rejects_regression() {
    let mut sim = Simulation::new(ScriptStrategy::new(vec![]));
    sim.set_up().unwrap();
    let obs = flat(2, 1.0);
    sim.step(&obs[1]).unwrap();
    assert!(matches!(
        sim.step(&obs[0]),
        Err(EngineError::Data(DataError::TimestampRegression { .. }))
    ));
    assert!(matches!(
        sim.step(&obs[1]),
        Err(EngineError::InvalidPhase { .. })
    ));
}

// ─── Reference strategies ───────────────────────────────────────────

#[test]
fn basis_stays_hedged_through_a_rally() {
    let prices: Vec<f64> = (0..48).map(|i| 100.0 * 1.015_f64.powi(i)).collect();
    let observations = basis_observations(SPOT, HEDGE, t0(), Duration::hours(1), &prices, 0.0);
    let params = BasisParams::from_point(&point([
        ("MIN_LEVERAGE", 1.0),
        ("TARGET_LEVERAGE", 3.0),
        ("MAX_LEVERAGE", 5.0),
    ]))
    .unwrap();

    let mut sim = Simulation::new(BasisStrategy::new(params));
    let result = sim.run(&observations).unwrap();
    assert_eq!(result.failed_actions(), 0);

    let spot = sim.registry().get_as::<SpotEntity>(SPOT).unwrap();
    let hedge = sim.registry().get_as::<PerpEntity>(HEDGE).unwrap();
    let mismatch = (hedge.size() + spot.product()).abs() / spot.product();
    assert!(mismatch < 1e-9, "hedge drifted: {mismatch}");
    assert!(hedge.leverage() <= 5.0 + 1e-9);
    assert!(hedge.balance() > 0.0);
}

#[test]
fn threshold_buys_low_and_sells_high() {
    let mut prices = vec![40.0; 10];
    prices.extend(vec![70.0; 10]);
    let observations = spot_observations("EXCHANGE", t0(), Duration::days(1), &prices);
    let params = ThresholdParams::new(50.0, 60.0, 0.5, 10_000.0, 0.0).unwrap();

    let result = Simulation::new(ThresholdStrategy::new(params))
        .run(&observations)
        .unwrap();
    assert_eq!(result.failed_actions(), 0);
    assert!(result.metrics.accumulated_return > 0.5);
    assert!(result.metrics.max_drawdown <= 0.0);
}
