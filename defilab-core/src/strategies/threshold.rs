//! Price-threshold holder: buy a share of cash below one price, sell a share
//! of holdings above another.

use serde::{Deserialize, Serialize};

use crate::domain::{Action, ActionToTake};
use crate::entity::spot::DEFAULT_SPOT_FEE;
use crate::entity::SpotEntity;
use crate::error::{ConfigError, EngineError};
use crate::strategy::params::{ensure, ensure_fee, ensure_positive, get_or, require};
use crate::strategy::{expect_entity, ParamPoint, SetUpContext, StepContext, Strategy, StrategyParams};

pub const EXCHANGE: &str = "EXCHANGE";

/// Trades smaller than this are skipped.
const MIN_TRADE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdParams {
    pub buy_price: f64,
    pub sell_price: f64,
    pub trade_share: f64,
    pub initial_balance: f64,
    pub trading_fee: f64,
}

impl ThresholdParams {
    pub fn new(
        buy_price: f64,
        sell_price: f64,
        trade_share: f64,
        initial_balance: f64,
        trading_fee: f64,
    ) -> Result<Self, ConfigError> {
        ensure_positive("BUY_PRICE", buy_price)?;
        if sell_price <= buy_price || !sell_price.is_finite() {
            return Err(ConfigError::Ordering(format!(
                "BUY_PRICE ({buy_price}) must be below SELL_PRICE ({sell_price})"
            )));
        }
        ensure(
            trade_share > 0.0 && trade_share <= 1.0,
            "TRADE_SHARE",
            trade_share,
            "must be in (0, 1]",
        )?;
        ensure_positive("INITIAL_BALANCE", initial_balance)?;
        ensure_fee("TRADING_FEE", trading_fee)?;
        Ok(Self {
            buy_price,
            sell_price,
            trade_share,
            initial_balance,
            trading_fee,
        })
    }
}

impl StrategyParams for ThresholdParams {
    fn from_point(point: &ParamPoint) -> Result<Self, ConfigError> {
        Self::new(
            require(point, "BUY_PRICE")?,
            require(point, "SELL_PRICE")?,
            get_or(point, "TRADE_SHARE", 0.01),
            get_or(point, "INITIAL_BALANCE", 10_000.0),
            get_or(point, "TRADING_FEE", DEFAULT_SPOT_FEE),
        )
    }

    fn to_point(&self) -> ParamPoint {
        crate::strategy::params::point([
            ("BUY_PRICE", self.buy_price),
            ("SELL_PRICE", self.sell_price),
            ("TRADE_SHARE", self.trade_share),
            ("INITIAL_BALANCE", self.initial_balance),
            ("TRADING_FEE", self.trading_fee),
        ])
    }
}

#[derive(Debug, Clone)]
pub struct ThresholdStrategy {
    params: ThresholdParams,
}

impl ThresholdStrategy {
    pub fn new(params: ThresholdParams) -> Self {
        Self { params }
    }
}

impl Strategy for ThresholdStrategy {
    type Params = ThresholdParams;

    fn params(&self) -> &ThresholdParams {
        &self.params
    }

    fn set_up(&mut self, ctx: &mut SetUpContext<'_>) -> Result<(), EngineError> {
        ctx.register(EXCHANGE, SpotEntity::new(self.params.trading_fee))?;
        ctx.execute(ActionToTake::new(
            EXCHANGE,
            Action::deposit(self.params.initial_balance),
        ))
        .map_err(EngineError::SetUp)?;
        Ok(())
    }

    fn predict(&mut self, ctx: &StepContext<'_>) -> Result<Vec<ActionToTake>, EngineError> {
        let exchange = expect_entity::<SpotEntity>(ctx, EXCHANGE)?;
        let Some(price) = exchange.price() else {
            return Ok(Vec::new());
        };

        if price < self.params.buy_price {
            let notional = self.params.trade_share * exchange.state().cash;
            if notional / price < MIN_TRADE {
                return Ok(Vec::new());
            }
            return Ok(vec![ActionToTake::new(EXCHANGE, Action::buy(notional))]);
        }
        if price > self.params.sell_price {
            let product = self.params.trade_share * exchange.state().product;
            if product < MIN_TRADE {
                return Ok(Vec::new());
            }
            return Ok(vec![ActionToTake::new(EXCHANGE, Action::sell(product))]);
        }
        Ok(Vec::new())
    }
}
