//! Basis trade: hold spot product, short the same size on a perp venue, and
//! keep the hedge leverage inside `[MIN_LEVERAGE, MAX_LEVERAGE]`.
//!
//! Equity is split so the hedge holds `E / (1 + T)` and spot holds the rest,
//! which puts the short at leverage `T` when sizes match.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{Action, ActionToTake, Amount, Measure};
use crate::entity::perp::{DEFAULT_MAX_LEVERAGE, DEFAULT_PERP_FEE};
use crate::entity::spot::DEFAULT_SPOT_FEE;
use crate::entity::{Entity, PerpEntity, SpotEntity};
use crate::error::{ConfigError, EngineError};
use crate::strategy::params::{ensure_fee, ensure_positive, get_or, point, require};
use crate::strategy::{expect_entity, ParamPoint, SetUpContext, StepContext, Strategy, StrategyParams};

pub const SPOT: &str = "SPOT";
pub const HEDGE: &str = "HEDGE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasisParams {
    pub min_leverage: f64,
    pub target_leverage: f64,
    pub max_leverage: f64,
    pub initial_balance: f64,
    pub spot_fee: f64,
    pub perp_fee: f64,
    /// Venue bound; the strategy bounds must fit under it.
    pub perp_max_leverage: f64,
}

impl BasisParams {
    /// `0 < MIN < TARGET < MAX <= PERP_MAX_LEVERAGE`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive("MIN_LEVERAGE", self.min_leverage)?;
        ensure_positive("INITIAL_BALANCE", self.initial_balance)?;
        ensure_positive("PERP_MAX_LEVERAGE", self.perp_max_leverage)?;
        ensure_fee("SPOT_FEE", self.spot_fee)?;
        ensure_fee("PERP_FEE", self.perp_fee)?;
        if !(self.min_leverage < self.target_leverage && self.target_leverage < self.max_leverage)
        {
            return Err(ConfigError::Ordering(format!(
                "MIN_LEVERAGE < TARGET_LEVERAGE < MAX_LEVERAGE required, got {} / {} / {}",
                self.min_leverage, self.target_leverage, self.max_leverage
            )));
        }
        if self.max_leverage > self.perp_max_leverage {
            return Err(ConfigError::OutOfRange {
                name: "MAX_LEVERAGE".into(),
                value: self.max_leverage,
                reason: format!("exceeds venue maximum {}", self.perp_max_leverage),
            });
        }
        Ok(())
    }
}

impl StrategyParams for BasisParams {
    fn from_point(point: &ParamPoint) -> Result<Self, ConfigError> {
        let params = Self {
            min_leverage: require(point, "MIN_LEVERAGE")?,
            target_leverage: require(point, "TARGET_LEVERAGE")?,
            max_leverage: require(point, "MAX_LEVERAGE")?,
            initial_balance: get_or(point, "INITIAL_BALANCE", 1_000_000.0),
            spot_fee: get_or(point, "SPOT_FEE", DEFAULT_SPOT_FEE),
            perp_fee: get_or(point, "PERP_FEE", DEFAULT_PERP_FEE),
            perp_max_leverage: get_or(point, "PERP_MAX_LEVERAGE", DEFAULT_MAX_LEVERAGE),
        };
        params.validate()?;
        Ok(params)
    }

    fn to_point(&self) -> ParamPoint {
        point([
            ("MIN_LEVERAGE", self.min_leverage),
            ("TARGET_LEVERAGE", self.target_leverage),
            ("MAX_LEVERAGE", self.max_leverage),
            ("INITIAL_BALANCE", self.initial_balance),
            ("SPOT_FEE", self.spot_fee),
            ("PERP_FEE", self.perp_fee),
            ("PERP_MAX_LEVERAGE", self.perp_max_leverage),
        ])
    }
}

#[derive(Debug, Clone)]
pub struct BasisStrategy {
    params: BasisParams,
}

impl BasisStrategy {
    pub fn new(params: BasisParams) -> Self {
        Self { params }
    }

    fn deposit(&self) -> Vec<ActionToTake> {
        let to_hedge = self.params.initial_balance / (1.0 + self.params.target_leverage);
        let to_spot = self.params.initial_balance - to_hedge;
        vec![
            ActionToTake::new(SPOT, Action::deposit(to_spot)),
            ActionToTake::new(HEDGE, Action::deposit(to_hedge)),
            ActionToTake::new(SPOT, Action::buy(to_spot)),
            ActionToTake::new(
                HEDGE,
                Action::open_position(Amount::scaled(SPOT, Measure::Product, -1.0)),
            ),
        ]
    }

    fn rebalance(&self, spot: &SpotEntity, hedge: &PerpEntity, price: f64) -> Vec<ActionToTake> {
        let hedge_balance = hedge.balance();
        let spot_balance = spot.balance();
        let equity = hedge_balance + spot_balance;
        let target_hedge = equity / (1.0 + self.params.target_leverage);
        let target_spot = equity - target_hedge;
        let delta_spot = target_spot - spot_balance;
        let delta_hedge = target_hedge - hedge_balance;

        debug!(
            equity,
            delta_spot,
            delta_hedge,
            leverage = hedge.leverage(),
            "basis rebalance"
        );

        let spot_cash = Amount::of(SPOT, Measure::Cash);

        if hedge.state().position.is_none() && hedge_balance <= 0.0 {
            let to_sell = (-delta_spot / price).clamp(0.0, spot.product());
            return vec![
                ActionToTake::new(SPOT, Action::sell(to_sell)),
                ActionToTake::new(HEDGE, Action::deposit(spot_cash.clone())),
                ActionToTake::new(SPOT, Action::withdraw(spot_cash)),
                ActionToTake::new(
                    HEDGE,
                    Action::open_position(Amount::scaled(SPOT, Measure::Product, -1.0)),
                ),
            ];
        }

        if delta_spot > 0.0 {
            let notional = -delta_hedge;
            let bought = notional / price * (1.0 - self.params.spot_fee);
            return vec![
                ActionToTake::new(HEDGE, Action::withdraw(notional)),
                ActionToTake::new(SPOT, Action::deposit(notional)),
                ActionToTake::new(SPOT, Action::buy(notional)),
                ActionToTake::new(HEDGE, Action::open_position(-bought)),
            ];
        }

        if delta_spot < 0.0 {
            let to_sell = -delta_spot / price;
            return vec![
                ActionToTake::new(SPOT, Action::sell(to_sell)),
                ActionToTake::new(HEDGE, Action::deposit(spot_cash.clone())),
                ActionToTake::new(HEDGE, Action::open_position(to_sell)),
                ActionToTake::new(SPOT, Action::withdraw(spot_cash)),
            ];
        }

        Vec::new()
    }
}

impl Strategy for BasisStrategy {
    type Params = BasisParams;

    fn params(&self) -> &BasisParams {
        &self.params
    }

    fn set_up(&mut self, ctx: &mut SetUpContext<'_>) -> Result<(), EngineError> {
        ctx.register(SPOT, SpotEntity::new(self.params.spot_fee))?;
        ctx.register(
            HEDGE,
            PerpEntity::new(self.params.perp_max_leverage, self.params.perp_fee),
        )?;
        Ok(())
    }

    fn predict(&mut self, ctx: &StepContext<'_>) -> Result<Vec<ActionToTake>, EngineError> {
        let spot = expect_entity::<SpotEntity>(ctx, SPOT)?;
        let hedge = expect_entity::<PerpEntity>(ctx, HEDGE)?;
        let Some(price) = spot.price() else {
            return Ok(Vec::new());
        };
        if hedge.mark_price().is_none() {
            return Ok(Vec::new());
        }

        if hedge.balance() == 0.0 && spot.balance() == 0.0 {
            return Ok(self.deposit());
        }
        if hedge.balance() <= 0.0 && spot.balance() > 0.0 {
            return Ok(self.rebalance(spot, hedge, price));
        }
        let leverage = hedge.leverage();
        if leverage > self.params.max_leverage || leverage < self.params.min_leverage {
            return Ok(self.rebalance(spot, hedge, price));
        }
        Ok(Vec::new())
    }
}
