//! Constant-product liquidity pool (V2-style LP position).
//!
//! A position is entered 50/50 at the observed price and then follows the
//! `x · y = L²` curve: on every new price `token0 = L·√p` and
//! `token1 = L/√p`. The position's share of the pool's per-step fees,
//! `L / pool_liquidity · fees`, is credited to cash.

use std::any::Any;

use super::{check_action, insufficient, state_mismatch, Entity};
use crate::domain::{
    ActionEffect, ActionKind, EntityKind, GlobalState, InternalState, PoolGlobalState,
    PoolInternalState, ResolvedAction,
};
use crate::error::{DataError, DomainError};

pub const DEFAULT_POOL_FEE: f64 = 0.003;

/// LP value relative to simply holding the entry basket, `2√r / (1 + r) - 1`
/// with `r = price / entry_price`. Always ≤ 0.
pub fn impermanent_loss(entry_price: f64, price: f64) -> f64 {
    if entry_price <= 0.0 || price <= 0.0 {
        return 0.0;
    }
    let r = price / entry_price;
    2.0 * r.sqrt() / (1.0 + r) - 1.0
}

/// Liquidity-providing venue. `trading_fee` is charged when entering and
/// when leaving the position.
#[derive(Debug, Clone)]
pub struct PoolEntity {
    trading_fee: f64,
    global: Option<PoolGlobalState>,
    internal: PoolInternalState,
}

impl PoolEntity {
    pub fn new(trading_fee: f64) -> Self {
        Self {
            trading_fee,
            global: None,
            internal: PoolInternalState::default(),
        }
    }

    pub fn trading_fee(&self) -> f64 {
        self.trading_fee
    }

    pub fn price(&self) -> Option<f64> {
        self.global.map(|g| g.price)
    }

    pub fn state(&self) -> &PoolInternalState {
        &self.internal
    }

    pub fn has_position(&self) -> bool {
        self.internal.liquidity > 0.0
    }

    /// Mark-to-market value of the LP tokens, excluding idle cash.
    pub fn position_value(&self) -> f64 {
        self.internal.token0 + self.internal.token1 * self.price().unwrap_or(0.0)
    }

    pub fn impermanent_loss(&self) -> f64 {
        match self.price() {
            Some(price) if self.has_position() => {
                impermanent_loss(self.internal.entry_price, price)
            }
            _ => 0.0,
        }
    }

    fn open_position(&mut self, notional: f64) -> Result<ActionEffect, DomainError> {
        let price = self.price().ok_or(DomainError::NoMarketPrice)?;
        if self.has_position() {
            return Err(DomainError::PositionAlreadyOpen);
        }
        if notional > self.internal.cash {
            return Err(insufficient("cash", notional, self.internal.cash));
        }
        let invested = notional * (1.0 - self.trading_fee);
        let token0 = invested / 2.0;
        let token1 = invested / 2.0 / price;

        self.internal.cash -= notional;
        self.internal.token0 = token0;
        self.internal.token1 = token1;
        self.internal.liquidity = (token0 * token1).sqrt();
        self.internal.entry_price = price;
        Ok(ActionEffect {
            filled: invested,
            fee: notional * self.trading_fee,
        })
    }

    /// Withdraw `share ∈ (0, 1]` of the position into cash.
    fn close_position(&mut self, share: f64) -> Result<ActionEffect, DomainError> {
        if !self.has_position() {
            return Err(DomainError::NoOpenPosition);
        }
        if share <= 0.0 || share > 1.0 {
            return Err(DomainError::InvalidAmount {
                action: ActionKind::ClosePosition,
                amount: share,
            });
        }
        let gross = self.position_value() * share;
        let proceeds = gross * (1.0 - self.trading_fee);

        self.internal.cash += proceeds;
        if share >= 1.0 {
            self.internal = PoolInternalState {
                cash: self.internal.cash,
                ..PoolInternalState::default()
            };
        } else {
            let keep = 1.0 - share;
            self.internal.token0 *= keep;
            self.internal.token1 *= keep;
            self.internal.liquidity *= keep;
        }
        Ok(ActionEffect {
            filled: proceeds,
            fee: gross * self.trading_fee,
        })
    }
}

impl Default for PoolEntity {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_FEE)
    }
}

impl Entity for PoolEntity {
    fn kind(&self) -> EntityKind {
        EntityKind::Pool
    }

    fn global_state(&self) -> Option<GlobalState> {
        self.global.map(GlobalState::Pool)
    }

    fn internal_state(&self) -> InternalState {
        InternalState::Pool(self.internal)
    }

    /// Move the position along the curve, then credit its fee share.
    fn apply_global_state(&mut self, state: &GlobalState) -> Result<(), DataError> {
        let g = match state {
            GlobalState::Pool(g) => *g,
            other => return Err(state_mismatch(EntityKind::Pool, other)),
        };
        self.global = Some(g);

        if self.has_position() {
            let root = g.price.sqrt();
            self.internal.token0 = self.internal.liquidity * root;
            self.internal.token1 = self.internal.liquidity / root;
            if g.liquidity > 0.0 {
                self.internal.cash += self.internal.liquidity / g.liquidity * g.fees;
            }
        }
        Ok(())
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
            ActionKind::OpenPosition => self.open_position(action.amount),
            ActionKind::ClosePosition => self.close_position(action.amount),
            other => Err(DomainError::UnsupportedAction {
                kind: self.kind(),
                action: other,
            }),
        }
    }

    fn balance(&self) -> f64 {
        self.internal.cash + self.position_value()
    }

    fn cash(&self) -> f64 {
        self.internal.cash
    }

    fn product(&self) -> f64 {
        self.internal.token1
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(price: f64, fees: f64, liquidity: f64) -> GlobalState {
        GlobalState::pool(price, fees, liquidity)
    }

    fn open(cash: f64, price: f64, fee: f64) -> PoolEntity {
        let mut pool = PoolEntity::new(fee);
        pool.apply_global_state(&market(price, 0.0, 0.0)).unwrap();
        pool.execute(&ResolvedAction::new(ActionKind::Deposit, cash))
            .unwrap();
        pool.execute(&ResolvedAction::new(ActionKind::OpenPosition, cash))
            .unwrap();
        pool
    }

    #[test]
    fn open_splits_evenly_after_fee() {
        let pool = open(1_000.0, 4.0, 0.01);
        let s = pool.state();
        assert_eq!(s.cash, 0.0);
        assert!((s.token0 - 495.0).abs() < 1e-9);
        assert!((s.token1 - 123.75).abs() < 1e-9);
        assert!((s.liquidity - (495.0_f64 * 123.75).sqrt()).abs() < 1e-9);
        assert_eq!(s.entry_price, 4.0);
        assert!((pool.balance() - 990.0).abs() < 1e-9);
    }

    #[test]
    fn price_move_follows_constant_product() {
        let mut pool = open(1_000.0, 1.0, 0.0);
        let k = pool.state().token0 * pool.state().token1;
        pool.apply_global_state(&market(4.0, 0.0, 0.0)).unwrap();

        let s = pool.state();
        assert!((s.token0 * s.token1 - k).abs() < 1e-6);
        // 500 notional + 500 product at 1 → 1000 notional + 250 product at 4
        assert!((s.token0 - 1_000.0).abs() < 1e-9);
        assert!((s.token1 - 250.0).abs() < 1e-9);
        assert!((pool.balance() - 2_000.0).abs() < 1e-9);

        // Holding would be worth 500 + 500·4 = 2500
        assert!((pool.impermanent_loss() - (2_000.0 / 2_500.0 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn fee_share_is_credited_to_cash() {
        let mut pool = open(1_000.0, 1.0, 0.0);
        let liquidity = pool.state().liquidity;
        pool.apply_global_state(&market(1.0, 30.0, liquidity * 10.0))
            .unwrap();
        assert!((pool.cash() - 3.0).abs() < 1e-9);
        assert!((pool.balance() - 1_003.0).abs() < 1e-9);
    }

    #[test]
    fn empty_pool_liquidity_accrues_nothing() {
        let mut pool = open(1_000.0, 1.0, 0.0);
        pool.apply_global_state(&market(1.0, 30.0, 0.0)).unwrap();
        assert_eq!(pool.cash(), 0.0);
    }

    #[test]
    fn partial_then_full_close() {
        let mut pool = open(1_000.0, 1.0, 0.0);
        let effect = pool
            .execute(&ResolvedAction::new(ActionKind::ClosePosition, 0.25))
            .unwrap();
        assert!((effect.filled - 250.0).abs() < 1e-9);
        assert!(pool.has_position());
        assert!((pool.position_value() - 750.0).abs() < 1e-9);

        pool.execute(&ResolvedAction::new(ActionKind::ClosePosition, 1.0))
            .unwrap();
        assert!(!pool.has_position());
        assert_eq!(pool.state().token1, 0.0);
        assert!((pool.cash() - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn close_charges_trading_fee() {
        let mut pool = open(1_000.0, 1.0, 0.01);
        let effect = pool
            .execute(&ResolvedAction::new(ActionKind::ClosePosition, 1.0))
            .unwrap();
        assert!((effect.filled - 990.0 * 0.99).abs() < 1e-9);
        assert!((effect.fee - 9.9).abs() < 1e-9);
    }

    #[test]
    fn second_open_and_empty_close_are_rejected() {
        let mut pool = open(1_000.0, 1.0, 0.0);
        pool.execute(&ResolvedAction::new(ActionKind::Deposit, 10.0))
            .unwrap();
        assert_eq!(
            pool.execute(&ResolvedAction::new(ActionKind::OpenPosition, 10.0)),
            Err(DomainError::PositionAlreadyOpen)
        );

        let mut idle = PoolEntity::default();
        assert_eq!(
            idle.execute(&ResolvedAction::new(ActionKind::ClosePosition, 1.0)),
            Err(DomainError::NoOpenPosition)
        );
    }

    #[test]
    fn invalid_close_share_leaves_position() {
        let mut pool = open(1_000.0, 1.0, 0.0);
        let before = *pool.state();
        for share in [0.0, 1.5] {
            assert!(matches!(
                pool.execute(&ResolvedAction::new(ActionKind::ClosePosition, share)),
                Err(DomainError::InvalidAmount { .. })
            ));
        }
        assert_eq!(*pool.state(), before);
    }

    #[test]
    fn opening_needs_price_and_cash() {
        let mut pool = PoolEntity::default();
        pool.execute(&ResolvedAction::new(ActionKind::Deposit, 10.0))
            .unwrap();
        assert_eq!(
            pool.execute(&ResolvedAction::new(ActionKind::OpenPosition, 5.0)),
            Err(DomainError::NoMarketPrice)
        );
        pool.apply_global_state(&market(2.0, 0.0, 0.0)).unwrap();
        assert!(matches!(
            pool.execute(&ResolvedAction::new(ActionKind::OpenPosition, 11.0)),
            Err(DomainError::InsufficientBalance { asset: "cash", .. })
        ));
        assert!(matches!(
            pool.execute(&ResolvedAction::new(ActionKind::OpenPosition, -1.0)),
            Err(DomainError::InvalidAmount { .. })
        ));
    }

    #[test]
    fn impermanent_loss_is_symmetric_and_non_positive() {
        assert_eq!(impermanent_loss(100.0, 100.0), 0.0);
        let up = impermanent_loss(100.0, 200.0);
        let down = impermanent_loss(100.0, 50.0);
        assert!(up < 0.0);
        assert!((up - down).abs() < 1e-12);
    }

    #[test]
    fn wrong_state_kind_is_rejected() {
        let mut pool = PoolEntity::default();
        assert!(pool.apply_global_state(&GlobalState::spot(1.0)).is_err());
        assert!(pool.global_state().is_none());
    }
}
