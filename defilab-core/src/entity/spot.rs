//! Single spot exchange: hold cash and one product, trade at the observed price.

use std::any::Any;

use super::{check_action, insufficient, state_mismatch, Entity};
use crate::domain::{
    ActionEffect, ActionKind, EntityKind, GlobalState, InternalState, ResolvedAction,
    SpotGlobalState, SpotInternalState,
};
use crate::error::{DataError, DomainError};

pub const DEFAULT_SPOT_FEE: f64 = 0.005;

/// Spot venue. Buy fees are taken in product, sell fees in notional.
#[derive(Debug, Clone)]
pub struct SpotEntity {
    trading_fee: f64,
    global: Option<SpotGlobalState>,
    internal: SpotInternalState,
}

impl SpotEntity {
    pub fn new(trading_fee: f64) -> Self {
        Self {
            trading_fee,
            global: None,
            internal: SpotInternalState::default(),
        }
    }

    pub fn trading_fee(&self) -> f64 {
        self.trading_fee
    }

    pub fn price(&self) -> Option<f64> {
        self.global.map(|g| g.price)
    }

    pub fn state(&self) -> &SpotInternalState {
        &self.internal
    }

    fn require_price(&self) -> Result<f64, DomainError> {
        self.price().ok_or(DomainError::NoMarketPrice)
    }

    fn buy(&mut self, notional: f64) -> Result<ActionEffect, DomainError> {
        let price = self.require_price()?;
        if notional > self.internal.cash {
            return Err(insufficient("cash", notional, self.internal.cash));
        }
        let gross = notional / price;
        let filled = gross * (1.0 - self.trading_fee);
        self.internal.cash -= notional;
        self.internal.product += filled;
        Ok(ActionEffect {
            filled,
            fee: notional * self.trading_fee,
        })
    }

    fn sell(&mut self, product: f64) -> Result<ActionEffect, DomainError> {
        let price = self.require_price()?;
        if product > self.internal.product {
            return Err(insufficient("product", product, self.internal.product));
        }
        let gross = product * price;
        let filled = gross * (1.0 - self.trading_fee);
        self.internal.product -= product;
        self.internal.cash += filled;
        Ok(ActionEffect {
            filled,
            fee: gross * self.trading_fee,
        })
    }
}

impl Default for SpotEntity {
    fn default() -> Self {
        Self::new(DEFAULT_SPOT_FEE)
    }
}

impl Entity for SpotEntity {
    fn kind(&self) -> EntityKind {
        EntityKind::Spot
    }

    fn global_state(&self) -> Option<GlobalState> {
        self.global.map(GlobalState::Spot)
    }

    fn internal_state(&self) -> InternalState {
        InternalState::Spot(self.internal)
    }

    fn apply_global_state(&mut self, state: &GlobalState) -> Result<(), DataError> {
        match state {
            GlobalState::Spot(s) => {
                self.global = Some(*s);
                Ok(())
            }
            other => Err(state_mismatch(EntityKind::Spot, other)),
        }
    }

    fn execute(&mut self, action: &ResolvedAction) -> Result<ActionEffect, DomainError> {
        check_action(self.kind(), action)?;
        match action.kind {
            ActionKind::Deposit => {
                self.internal.cash += action.amount;
                Ok(ActionEffect {
                    filled: action.amount,
                    fee: 0.0,
                })
            }
            ActionKind::Withdraw => {
                if action.amount > self.internal.cash {
                    return Err(insufficient("cash", action.amount, self.internal.cash));
                }
                self.internal.cash -= action.amount;
                Ok(ActionEffect {
                    filled: action.amount,
                    fee: 0.0,
                })
            }
            ActionKind::Buy => self.buy(action.amount),
            ActionKind::Sell => self.sell(action.amount),
            other => Err(DomainError::UnsupportedAction {
                kind: self.kind(),
                action: other,
            }),
        }
    }

    fn balance(&self) -> f64 {
        self.internal.product * self.price().unwrap_or(0.0) + self.internal.cash
    }

    fn cash(&self) -> f64 {
        self.internal.cash
    }

    fn product(&self) -> f64 {
        self.internal.product
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
