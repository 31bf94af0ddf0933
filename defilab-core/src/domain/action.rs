//! Actions: tagged, entity-scoped commands with a single amount argument.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of action kinds across all entity categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Deposit,
    Withdraw,
    Buy,
    Sell,
    Borrow,
    Repay,
    OpenPosition,
    ClosePosition,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Deposit => "deposit",
            ActionKind::Withdraw => "withdraw",
            ActionKind::Buy => "buy",
            ActionKind::Sell => "sell",
            ActionKind::Borrow => "borrow",
            ActionKind::Repay => "repay",
            ActionKind::OpenPosition => "open_position",
            ActionKind::ClosePosition => "close_position",
        };
        f.write_str(name)
    }
}

/// Which ledger figure a deferred amount reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measure {
    /// Notional-side holdings: spot cash, lending collateral, perp collateral,
    /// idle pool cash.
    Cash,
    /// Product-side holdings: spot product, lending debt, perp net size,
    /// pool product leg.
    Product,
    /// Mark-to-market value.
    Balance,
}

fn unit_scale() -> f64 {
    1.0
}

/// Reference to another entity's ledger, read right before execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmountRef {
    pub entity: String,
    pub measure: Measure,
    #[serde(default = "unit_scale")]
    pub scale: f64,
}

/// Action argument. `Deferred` lets one action size itself from the effect of
/// an earlier action in the same step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Amount {
    Fixed(f64),
    Deferred(AmountRef),
}

impl Amount {
    pub fn of(entity: impl Into<String>, measure: Measure) -> Self {
        Amount::Deferred(AmountRef {
            entity: entity.into(),
            measure,
            scale: 1.0,
        })
    }

    pub fn scaled(entity: impl Into<String>, measure: Measure, scale: f64) -> Self {
        Amount::Deferred(AmountRef {
            entity: entity.into(),
            measure,
            scale,
        })
    }
}

impl From<f64> for Amount {
    fn from(value: f64) -> Self {
        Amount::Fixed(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Deposit { amount_in_notional: Amount },
    Withdraw { amount_in_notional: Amount },
    Buy { amount_in_notional: Amount },
    Sell { amount_in_product: Amount },
    Borrow { amount_in_product: Amount },
    Repay { amount_in_product: Amount },
    /// Perp: signed product amount, positive opens/extends long, negative
    /// short. Pool: notional to provide as liquidity.
    OpenPosition { amount_in_product: Amount },
    /// Pool: fraction of the position to withdraw, in `(0, 1]`.
    ClosePosition { share: Amount },
}

impl Action {
    pub fn deposit(amount: impl Into<Amount>) -> Self {
        Action::Deposit {
            amount_in_notional: amount.into(),
        }
    }

    pub fn withdraw(amount: impl Into<Amount>) -> Self {
        Action::Withdraw {
            amount_in_notional: amount.into(),
        }
    }

    pub fn buy(amount: impl Into<Amount>) -> Self {
        Action::Buy {
            amount_in_notional: amount.into(),
        }
    }

    pub fn sell(amount: impl Into<Amount>) -> Self {
        Action::Sell {
            amount_in_product: amount.into(),
        }
    }

    pub fn borrow(amount: impl Into<Amount>) -> Self {
        Action::Borrow {
            amount_in_product: amount.into(),
        }
    }

    pub fn repay(amount: impl Into<Amount>) -> Self {
        Action::Repay {
            amount_in_product: amount.into(),
        }
    }

    pub fn open_position(amount: impl Into<Amount>) -> Self {
        Action::OpenPosition {
            amount_in_product: amount.into(),
        }
    }

    /// Withdraw the whole pool position.
    pub fn close_position() -> Self {
        Action::ClosePosition {
            share: Amount::Fixed(1.0),
        }
    }

    pub fn close_share(share: impl Into<Amount>) -> Self {
        Action::ClosePosition {
            share: share.into(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Deposit { .. } => ActionKind::Deposit,
            Action::Withdraw { .. } => ActionKind::Withdraw,
            Action::Buy { .. } => ActionKind::Buy,
            Action::Sell { .. } => ActionKind::Sell,
            Action::Borrow { .. } => ActionKind::Borrow,
            Action::Repay { .. } => ActionKind::Repay,
            Action::OpenPosition { .. } => ActionKind::OpenPosition,
            Action::ClosePosition { .. } => ActionKind::ClosePosition,
        }
    }

    pub fn amount(&self) -> &Amount {
        match self {
            Action::Deposit { amount_in_notional }
            | Action::Withdraw { amount_in_notional }
            | Action::Buy { amount_in_notional } => amount_in_notional,
            Action::Sell { amount_in_product }
            | Action::Borrow { amount_in_product }
            | Action::Repay { amount_in_product }
            | Action::OpenPosition { amount_in_product } => amount_in_product,
            Action::ClosePosition { share } => share,
        }
    }
}

/// Action with its amount resolved to a number. This is what entities execute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedAction {
    pub kind: ActionKind,
    pub amount: f64,
}

impl ResolvedAction {
    pub fn new(kind: ActionKind, amount: f64) -> Self {
        Self { kind, amount }
    }
}

/// An action bound to the registered entity that must execute it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionToTake {
    pub entity_name: String,
    pub action: Action,
}

impl ActionToTake {
    pub fn new(entity_name: impl Into<String>, action: Action) -> Self {
        Self {
            entity_name: entity_name.into(),
            action,
        }
    }
}

/// Realized effect of a successful execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionEffect {
    /// Amount actually credited, in the unit the action produces.
    pub filled: f64,
    /// Fee paid, in notional.
    pub fee: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_amount_serializes_as_number() {
        let json = serde_json::to_string(&Action::deposit(100.0)).unwrap();
        assert_eq!(json, r#"{"kind":"deposit","amount_in_notional":100.0}"#);
    }

    #[test]
    fn deferred_amount_parses_from_object() {
        let json = r#"{"kind":"open_position","amount_in_product":{"entity":"SPOT","measure":"product","scale":-1.0}}"#;
        let action: Action = serde_json::from_str(json).unwrap();
        assert_eq!(
            action,
            Action::open_position(Amount::scaled("SPOT", Measure::Product, -1.0))
        );
    }

    #[test]
    fn deferred_scale_defaults_to_one() {
        let json = r#"{"kind":"withdraw","amount_in_notional":{"entity":"SPOT","measure":"cash"}}"#;
        let action: Action = serde_json::from_str(json).unwrap();
        assert_eq!(action.amount(), &Amount::of("SPOT", Measure::Cash));
    }

    #[test]
    fn unknown_kind_fails_at_the_boundary() {
        let json = r#"{"kind":"swap","amount_in_notional":1.0}"#;
        assert!(serde_json::from_str::<Action>(json).is_err());
    }

    #[test]
    fn full_close_is_a_unit_share() {
        let json = serde_json::to_string(&Action::close_position()).unwrap();
        assert_eq!(json, r#"{"kind":"close_position","share":1.0}"#);
        assert_eq!(Action::close_share(0.5).kind(), ActionKind::ClosePosition);
    }

    #[test]
    fn kind_display_matches_wire_name() {
        let wire = serde_json::to_string(&ActionKind::OpenPosition).unwrap();
        assert_eq!(wire, format!("\"{}\"", ActionKind::OpenPosition));
    }
}
