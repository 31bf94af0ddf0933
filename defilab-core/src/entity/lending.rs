//! Isolated lending market: notional collateral, product debt.

use std::any::Any;

use super::{check_action, insufficient, state_mismatch, Entity};
use crate::domain::{
    ActionEffect, ActionKind, EntityKind, GlobalState, InternalState, LendingGlobalState,
    LendingInternalState, ResolvedAction,
};
use crate::error::{DataError, DomainError};

pub const DEFAULT_MAX_LTV: f64 = 0.8;
pub const DEFAULT_LIQUIDATION_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone)]
pub struct LendingEntity {
    max_ltv: f64,
    liquidation_threshold: f64,
    global: Option<LendingGlobalState>,
    internal: LendingInternalState,
}

impl LendingEntity {
    pub fn new(max_ltv: f64, liquidation_threshold: f64) -> Self {
        Self {
            max_ltv,
            liquidation_threshold,
            global: None,
            internal: LendingInternalState::default(),
        }
    }

    pub fn max_ltv(&self) -> f64 {
        self.max_ltv
    }

    pub fn state(&self) -> &LendingInternalState {
        &self.internal
    }

    /// Current loan-to-value. Zero without debt.
    pub fn ltv(&self) -> f64 {
        match self.global {
            Some(g) if self.internal.borrowed > 0.0 => {
                ltv_of(&g, self.internal.collateral, self.internal.borrowed)
            }
            _ => 0.0,
        }
    }

    /// Debt (in product) to repay so LTV drops to `target_ltv`.
    pub fn repay_for_target(&self, target_ltv: f64) -> Result<f64, DomainError> {
        let g = self.global.ok_or(DomainError::NoMarketPrice)?;
        let current = self.ltv();
        if !(0.0..=current).contains(&target_ltv) {
            return Err(DomainError::LtvExceeded {
                ltv: target_ltv,
                max: current,
            });
        }
        Ok(self.internal.collateral * g.notional_price * (current - target_ltv) / g.product_price)
    }

    fn require_prices(&self) -> Result<LendingGlobalState, DomainError> {
        self.global.ok_or(DomainError::NoMarketPrice)
    }

    fn withdraw(&mut self, amount: f64) -> Result<(), DomainError> {
        if amount > self.internal.collateral {
            return Err(insufficient("collateral", amount, self.internal.collateral));
        }
        if self.internal.borrowed > 0.0 {
            let g = self.require_prices()?;
            let ltv = ltv_of(&g, self.internal.collateral - amount, self.internal.borrowed);
            if ltv > self.max_ltv {
                return Err(DomainError::LtvExceeded {
                    ltv,
                    max: self.max_ltv,
                });
            }
        }
        self.internal.collateral -= amount;
        Ok(())
    }

    fn borrow(&mut self, amount: f64) -> Result<(), DomainError> {
        if self.internal.collateral <= 0.0 {
            return Err(DomainError::NoCollateral);
        }
        let g = self.require_prices()?;
        let ltv = ltv_of(&g, self.internal.collateral, self.internal.borrowed + amount);
        if ltv > self.max_ltv {
            return Err(DomainError::LtvExceeded {
                ltv,
                max: self.max_ltv,
            });
        }
        self.internal.borrowed += amount;
        Ok(())
    }

    fn repay(&mut self, amount: f64) -> Result<(), DomainError> {
        if amount > self.internal.borrowed {
            return Err(insufficient("debt", amount, self.internal.borrowed));
        }
        self.internal.borrowed -= amount;
        Ok(())
    }
}

impl Default for LendingEntity {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LTV, DEFAULT_LIQUIDATION_THRESHOLD)
    }
}

fn ltv_of(g: &LendingGlobalState, collateral: f64, borrowed: f64) -> f64 {
    let collateral_value = collateral * g.notional_price;
    if collateral_value <= 0.0 {
        return f64::INFINITY;
    }
    borrowed * g.product_price / collateral_value
}

impl Entity for LendingEntity {
    fn kind(&self) -> EntityKind {
        EntityKind::Lending
    }

    fn global_state(&self) -> Option<GlobalState> {
        self.global.map(GlobalState::Lending)
    }

    fn internal_state(&self) -> InternalState {
        InternalState::Lending(self.internal)
    }

    /// Accrue interest on both legs, then liquidate at the threshold.
    fn apply_global_state(&mut self, state: &GlobalState) -> Result<(), DataError> {
        let g = match state {
            GlobalState::Lending(g) => *g,
            other => return Err(state_mismatch(EntityKind::Lending, other)),
        };
        self.global = Some(g);
        self.internal.collateral *= 1.0 + g.lending_rate;
        self.internal.borrowed *= 1.0 + g.borrowing_rate;

        if self.internal.borrowed > 0.0 && self.ltv() >= self.liquidation_threshold {
            tracing::debug!(ltv = self.ltv(), "lending position liquidated");
            self.internal = LendingInternalState::default();
        }
        Ok(())
    }

    fn execute(&mut self, action: &ResolvedAction) -> Result<ActionEffect, DomainError> {
        check_action(self.kind(), action)?;
        match action.kind {
            ActionKind::Deposit => self.internal.collateral += action.amount,
            ActionKind::Withdraw => self.withdraw(action.amount)?,
            ActionKind::Borrow => self.borrow(action.amount)?,
            ActionKind::Repay => self.repay(action.amount)?,
            other => {
                return Err(DomainError::UnsupportedAction {
                    kind: self.kind(),
                    action: other,
                })
            }
        }
        Ok(ActionEffect {
            filled: action.amount,
            fee: 0.0,
        })
    }

    fn balance(&self) -> f64 {
        match self.global {
            Some(g) => {
                self.internal.collateral * g.notional_price
                    - self.internal.borrowed * g.product_price
            }
            None => self.internal.collateral,
        }
    }

    fn cash(&self) -> f64 {
        self.internal.collateral
    }

    fn product(&self) -> f64 {
        self.internal.borrowed
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(product_price: f64) -> GlobalState {
        GlobalState::lending(1.0, product_price, 0.0, 0.0)
    }

    fn with_collateral(amount: f64) -> LendingEntity {
        let mut lending = LendingEntity::default();
        lending.apply_global_state(&market(100.0)).unwrap();
        lending
            .execute(&ResolvedAction::new(ActionKind::Deposit, amount))
            .unwrap();
        lending
    }

    #[test]
    fn borrow_without_collateral_fails() {
        let mut lending = LendingEntity::default();
        lending.apply_global_state(&market(100.0)).unwrap();
        assert_eq!(
            lending.execute(&ResolvedAction::new(ActionKind::Borrow, 1.0)),
            Err(DomainError::NoCollateral)
        );
    }

    #[test]
    fn borrow_respects_max_ltv() {
        let mut lending = with_collateral(1_000.0);
        lending
            .execute(&ResolvedAction::new(ActionKind::Borrow, 8.0))
            .unwrap();
        assert!((lending.ltv() - 0.8).abs() < 1e-12);
        let err = lending
            .execute(&ResolvedAction::new(ActionKind::Borrow, 0.1))
            .unwrap_err();
        assert!(matches!(err, DomainError::LtvExceeded { .. }));
        assert_eq!(lending.state().borrowed, 8.0);
    }

    #[test]
    fn withdraw_blocked_by_ltv() {
        let mut lending = with_collateral(1_000.0);
        lending
            .execute(&ResolvedAction::new(ActionKind::Borrow, 5.0))
            .unwrap();
        assert!(lending
            .execute(&ResolvedAction::new(ActionKind::Withdraw, 500.0))
            .is_err());
        assert!(lending
            .execute(&ResolvedAction::new(ActionKind::Withdraw, 300.0))
            .is_ok());
    }

    #[test]
    fn repay_more_than_debt_fails() {
        let mut lending = with_collateral(1_000.0);
        lending
            .execute(&ResolvedAction::new(ActionKind::Borrow, 2.0))
            .unwrap();
        assert!(lending
            .execute(&ResolvedAction::new(ActionKind::Repay, 2.5))
            .is_err());
    }

    #[test]
    fn accrual_then_liquidation() {
        let mut lending = with_collateral(1_000.0);
        lending
            .execute(&ResolvedAction::new(ActionKind::Borrow, 8.0))
            .unwrap();
        lending
            .apply_global_state(&GlobalState::lending(1.0, 100.0, 0.01, 0.0))
            .unwrap();
        assert!((lending.state().collateral - 1_010.0).abs() < 1e-9);

        // 8 * 110 / 1010 > 0.85
        lending.apply_global_state(&market(110.0)).unwrap();
        assert_eq!(lending.state().collateral, 0.0);
        assert_eq!(lending.state().borrowed, 0.0);
    }

    #[test]
    fn balance_nets_debt() {
        let mut lending = with_collateral(1_000.0);
        lending
            .execute(&ResolvedAction::new(ActionKind::Borrow, 4.0))
            .unwrap();
        assert!((lending.balance() - 600.0).abs() < 1e-9);
    }

    #[test]
    fn repay_for_target_reaches_target() {
        let mut lending = with_collateral(1_000.0);
        lending
            .execute(&ResolvedAction::new(ActionKind::Borrow, 6.0))
            .unwrap();
        let repay = lending.repay_for_target(0.3).unwrap();
        assert!((repay - 3.0).abs() < 1e-9);
    }
}
