//! Perpetual futures venue with a single net position per entity.

use std::any::Any;

use super::{check_action, insufficient, state_mismatch, Entity};
use crate::domain::{
    ActionEffect, ActionKind, EntityKind, GlobalState, InternalState, PerpGlobalState,
    PerpInternalState, PerpPosition, ResolvedAction,
};
use crate::error::{DataError, DomainError};

pub const DEFAULT_MAX_LEVERAGE: f64 = 50.0;
pub const DEFAULT_PERP_FEE: f64 = 0.00035;

/// Positions smaller than this are treated as closed.
const DUST: f64 = 1e-12;

/// Isolated-margin perpetual market.
///
/// Trades net into one position. Increasing keeps a weighted-average entry,
/// reducing realizes PnL on the closed part and keeps the entry, flipping
/// re-enters at mark.
#[derive(Debug, Clone)]
pub struct PerpEntity {
    max_leverage: f64,
    trading_fee: f64,
    global: Option<PerpGlobalState>,
    internal: PerpInternalState,
}

impl PerpEntity {
    pub fn new(max_leverage: f64, trading_fee: f64) -> Self {
        Self {
            max_leverage,
            trading_fee,
            global: None,
            internal: PerpInternalState::default(),
        }
    }

    pub fn max_leverage(&self) -> f64 {
        self.max_leverage
    }

    pub fn trading_fee(&self) -> f64 {
        self.trading_fee
    }

    pub fn state(&self) -> &PerpInternalState {
        &self.internal
    }

    pub fn mark_price(&self) -> Option<f64> {
        self.global.map(|g| g.mark_price)
    }

    /// Signed net size.
    pub fn size(&self) -> f64 {
        self.internal.size()
    }

    pub fn unrealised_pnl(&self) -> f64 {
        match (self.internal.position, self.mark_price()) {
            (Some(p), Some(mark)) => p.amount * (mark - p.entry_price),
            _ => 0.0,
        }
    }

    /// `|size × mark| / balance`; zero when flat or when balance is zero.
    pub fn leverage(&self) -> f64 {
        let balance = self.balance();
        match self.mark_price() {
            Some(mark) if balance != 0.0 && self.size() != 0.0 => {
                (self.size() * mark / balance).abs()
            }
            _ => 0.0,
        }
    }

    pub fn maintenance_margin(&self) -> f64 {
        self.internal.position.map_or(0.0, |p| {
            p.entry_price * p.amount.abs() / (2.0 * self.max_leverage)
        })
    }

    fn withdraw(&mut self, amount: f64) -> Result<(), DomainError> {
        let balance = self.balance();
        if amount > balance {
            return Err(insufficient("balance", amount, balance));
        }
        if self.internal.position.is_some() {
            let remaining = balance - amount;
            let required = self.maintenance_margin();
            if remaining < required {
                return Err(DomainError::MaintenanceMargin {
                    required,
                    remaining,
                });
            }
            let mark = self.mark_price().ok_or(DomainError::NoMarketPrice)?;
            let leverage = leverage_at(self.size(), mark, remaining);
            if leverage > self.max_leverage {
                return Err(DomainError::LeverageOutOfBounds {
                    leverage,
                    max: self.max_leverage,
                });
            }
        }
        self.internal.collateral -= amount;
        Ok(())
    }

    fn open_position(&mut self, amount: f64) -> Result<ActionEffect, DomainError> {
        let mark = self.mark_price().ok_or(DomainError::NoMarketPrice)?;
        let fee = (mark * amount * self.trading_fee).abs();
        let (position, realized) = net(self.internal.position, amount, mark);
        let collateral = self.internal.collateral + realized - fee;

        if let Some(p) = position {
            let balance = collateral + p.amount * (mark - p.entry_price);
            let leverage = leverage_at(p.amount, mark, balance);
            if leverage > self.max_leverage {
                return Err(DomainError::LeverageOutOfBounds {
                    leverage,
                    max: self.max_leverage,
                });
            }
        }

        self.internal.collateral = collateral;
        self.internal.position = position;
        Ok(ActionEffect {
            filled: amount,
            fee,
        })
    }

    /// Liquidation price test for the current position, using collateral as
    /// margin balance.
    fn should_liquidate(&self, mark: f64) -> bool {
        let Some(p) = self.internal.position else {
            return false;
        };
        let size = p.amount.abs();
        let side = p.amount.signum();
        let maintenance = p.entry_price * size / (2.0 * self.max_leverage);
        let available = self.internal.collateral - maintenance;
        if available < 0.0 {
            return true;
        }
        let liq_price = (p.entry_price
            - side * available / (size * (1.0 - side / self.max_leverage)))
            .max(0.0);
        if side < 0.0 {
            mark >= liq_price
        } else {
            mark <= liq_price
        }
    }
}

impl Default for PerpEntity {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LEVERAGE, DEFAULT_PERP_FEE)
    }
}

fn leverage_at(size: f64, mark: f64, balance: f64) -> f64 {
    if size == 0.0 {
        return 0.0;
    }
    if balance <= 0.0 {
        return f64::INFINITY;
    }
    (size * mark / balance).abs()
}

/// Net a trade into an existing position. Returns the new position and the
/// PnL realized on any closed amount.
fn net(current: Option<PerpPosition>, trade: f64, mark: f64) -> (Option<PerpPosition>, f64) {
    let Some(p) = current else {
        if trade.abs() <= DUST {
            return (None, 0.0);
        }
        return (
            Some(PerpPosition {
                amount: trade,
                entry_price: mark,
            }),
            0.0,
        );
    };

    let new_amount = p.amount + trade;
    if new_amount.abs() <= DUST {
        return (None, p.amount * (mark - p.entry_price));
    }

    if p.amount.signum() == trade.signum() {
        let entry =
            (p.entry_price * p.amount.abs() + mark * trade.abs()) / new_amount.abs();
        return (
            Some(PerpPosition {
                amount: new_amount,
                entry_price: entry,
            }),
            0.0,
        );
    }

    if new_amount.signum() == p.amount.signum() {
        let closed = -trade;
        (
            Some(PerpPosition {
                amount: new_amount,
                entry_price: p.entry_price,
            }),
            closed * (mark - p.entry_price),
        )
    } else {
        (
            Some(PerpPosition {
                amount: new_amount,
                entry_price: mark,
            }),
            p.amount * (mark - p.entry_price),
        )
    }
}

impl Entity for PerpEntity {
    fn kind(&self) -> EntityKind {
        EntityKind::Perp
    }

    fn global_state(&self) -> Option<GlobalState> {
        self.global.map(GlobalState::Perp)
    }

    fn internal_state(&self) -> InternalState {
        InternalState::Perp(self.internal)
    }

    /// Liquidation check at the new mark, then funding settlement.
    fn apply_global_state(&mut self, state: &GlobalState) -> Result<(), DataError> {
        let g = match state {
            GlobalState::Perp(g) => *g,
            other => return Err(state_mismatch(EntityKind::Perp, other)),
        };
        self.global = Some(g);

        if self.should_liquidate(g.mark_price) {
            tracing::debug!(
                mark = g.mark_price,
                size = self.size(),
                "perp position liquidated"
            );
            self.internal = PerpInternalState::default();
        }

        self.internal.collateral -= self.size() * g.mark_price * g.funding_rate;
        Ok(())
    }

    fn execute(&mut self, action: &ResolvedAction) -> Result<ActionEffect, DomainError> {
        check_action(self.kind(), action)?;
        match action.kind {
            ActionKind::Deposit => {
                self.internal.collateral += action.amount;
                Ok(ActionEffect {
                    filled: action.amount,
                    fee: 0.0,
                })
            }
            ActionKind::Withdraw => {
                self.withdraw(action.amount)?;
                Ok(ActionEffect {
                    filled: action.amount,
                    fee: 0.0,
                })
            }
            ActionKind::OpenPosition => self.open_position(action.amount),
            other => Err(DomainError::UnsupportedAction {
                kind: self.kind(),
                action: other,
            }),
        }
    }

    /// Collateral plus unrealised PnL.
    fn balance(&self) -> f64 {
        self.internal.collateral + self.unrealised_pnl()
    }

    fn cash(&self) -> f64 {
        self.internal.collateral
    }

    fn product(&self) -> f64 {
        self.size()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hedge(collateral: f64, mark: f64) -> PerpEntity {
        let mut perp = PerpEntity::new(10.0, 0.0);
        perp.apply_global_state(&GlobalState::perp(mark, 0.0)).unwrap();
        perp.execute(&ResolvedAction::new(ActionKind::Deposit, collateral))
            .unwrap();
        perp
    }

    fn open(perp: &mut PerpEntity, amount: f64) -> Result<ActionEffect, DomainError> {
        perp.execute(&ResolvedAction::new(ActionKind::OpenPosition, amount))
    }

    #[test]
    fn leverage_bound_enforced() {
        let mut perp = hedge(100.0, 10.0);
        assert!(open(&mut perp, -100.0).is_ok());
        assert!((perp.leverage() - 10.0).abs() < 1e-9);
        let err = open(&mut perp, -1.0).unwrap_err();
        assert!(matches!(err, DomainError::LeverageOutOfBounds { .. }));
        assert_eq!(perp.size(), -100.0);
    }

    #[test]
    fn increasing_averages_entry() {
        let mut perp = hedge(1_000.0, 10.0);
        open(&mut perp, 10.0).unwrap();
        perp.apply_global_state(&GlobalState::perp(20.0, 0.0))
            .unwrap();
        open(&mut perp, 10.0).unwrap();
        let position = perp.state().position.unwrap();
        assert_eq!(position.amount, 20.0);
        assert!((position.entry_price - 15.0).abs() < 1e-12);
    }

    #[test]
    fn reducing_realizes_pnl_and_keeps_entry() {
        let mut perp = hedge(1_000.0, 10.0);
        open(&mut perp, -10.0).unwrap();
        perp.apply_global_state(&GlobalState::perp(8.0, 0.0))
            .unwrap();
        let before = perp.balance();
        open(&mut perp, 5.0).unwrap();
        let position = perp.state().position.unwrap();
        assert_eq!(position.amount, -5.0);
        assert_eq!(position.entry_price, 10.0);
        assert!((perp.cash() - 1_010.0).abs() < 1e-9);
        assert!((perp.balance() - before).abs() < 1e-9);
    }

    #[test]
    fn flipping_reenters_at_mark() {
        let mut perp = hedge(1_000.0, 10.0);
        open(&mut perp, 5.0).unwrap();
        perp.apply_global_state(&GlobalState::perp(12.0, 0.0))
            .unwrap();
        open(&mut perp, -8.0).unwrap();
        let position = perp.state().position.unwrap();
        assert_eq!(position.amount, -3.0);
        assert_eq!(position.entry_price, 12.0);
        assert!((perp.cash() - 1_010.0).abs() < 1e-9);
    }

    #[test]
    fn closing_clears_position() {
        let mut perp = hedge(1_000.0, 10.0);
        open(&mut perp, 5.0).unwrap();
        open(&mut perp, -5.0).unwrap();
        assert!(perp.state().position.is_none());
        assert_eq!(perp.leverage(), 0.0);
    }

    #[test]
    fn funding_paid_by_longs() {
        let mut perp = hedge(1_000.0, 10.0);
        open(&mut perp, 10.0).unwrap();
        perp.apply_global_state(&GlobalState::perp(10.0, 0.001))
            .unwrap();
        assert!((perp.cash() - 999.9).abs() < 1e-9);
    }

    #[test]
    fn short_liquidated_on_spike() {
        let mut perp = hedge(100.0, 10.0);
        open(&mut perp, -50.0).unwrap();
        perp.apply_global_state(&GlobalState::perp(12.5, 0.0))
            .unwrap();
        assert!(perp.state().position.is_none());
        assert_eq!(perp.cash(), 0.0);
    }

    #[test]
    fn withdraw_keeps_maintenance_margin() {
        let mut perp = hedge(100.0, 10.0);
        open(&mut perp, -50.0).unwrap();
        assert!(perp
            .execute(&ResolvedAction::new(ActionKind::Withdraw, 60.0))
            .is_err());
        assert!(perp
            .execute(&ResolvedAction::new(ActionKind::Withdraw, 10.0))
            .is_ok());
    }

    #[test]
    fn fee_charged_on_notional() {
        let mut perp = PerpEntity::new(50.0, 0.001);
        perp.apply_global_state(&GlobalState::perp(100.0, 0.0))
            .unwrap();
        perp.execute(&ResolvedAction::new(ActionKind::Deposit, 1_000.0))
            .unwrap();
        let effect = open(&mut perp, -2.0).unwrap();
        assert!((effect.fee - 0.2).abs() < 1e-12);
        assert!((perp.cash() - 999.8).abs() < 1e-9);
    }
}
