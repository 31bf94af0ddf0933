//! Market snapshots (`GlobalState`) and entity ledgers (`InternalState`).
//!
//! Each entity kind has its own pair of shapes. A `GlobalState` is replaced
//! wholesale on every observation; an `InternalState` is only mutated by the
//! owning entity's action methods.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::action::ActionKind;
use crate::error::DataError;

/// Category of an entity. Determines the state shapes and accepted actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Spot,
    Lending,
    Perp,
    Pool,
}

impl EntityKind {
    pub fn supported_actions(&self) -> &'static [ActionKind] {
        match self {
            EntityKind::Spot => &[
                ActionKind::Deposit,
                ActionKind::Withdraw,
                ActionKind::Buy,
                ActionKind::Sell,
            ],
            EntityKind::Lending => &[
                ActionKind::Deposit,
                ActionKind::Withdraw,
                ActionKind::Borrow,
                ActionKind::Repay,
            ],
            EntityKind::Perp => &[
                ActionKind::Deposit,
                ActionKind::Withdraw,
                ActionKind::OpenPosition,
            ],
            EntityKind::Pool => &[
                ActionKind::Deposit,
                ActionKind::Withdraw,
                ActionKind::OpenPosition,
                ActionKind::ClosePosition,
            ],
        }
    }

    pub fn supports(&self, action: ActionKind) -> bool {
        self.supported_actions().contains(&action)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Spot => "spot",
            EntityKind::Lending => "lending",
            EntityKind::Perp => "perp",
            EntityKind::Pool => "pool",
        };
        f.write_str(name)
    }
}

// ─── Global states ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpotGlobalState {
    pub price: f64,
}

/// Lending market snapshot. Rates are per step, not annualized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LendingGlobalState {
    pub notional_price: f64,
    pub product_price: f64,
    #[serde(default)]
    pub lending_rate: f64,
    #[serde(default)]
    pub borrowing_rate: f64,
}

/// Perpetual market snapshot. `funding_rate` is per step; a positive rate
/// means longs pay shorts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerpGlobalState {
    pub mark_price: f64,
    #[serde(default)]
    pub funding_rate: f64,
}

/// Liquidity pool snapshot. `price` is notional per product, `liquidity`
/// is the pool's `√(reserve0 · reserve1)` and `fees` the fees the whole pool
/// earned during the step, in notional.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolGlobalState {
    pub price: f64,
    #[serde(default)]
    pub tvl: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub fees: f64,
    #[serde(default)]
    pub liquidity: f64,
}

/// Snapshot of externally observed market facts for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GlobalState {
    Spot(SpotGlobalState),
    Lending(LendingGlobalState),
    Perp(PerpGlobalState),
    Pool(PoolGlobalState),
}

impl GlobalState {
    pub fn spot(price: f64) -> Self {
        GlobalState::Spot(SpotGlobalState { price })
    }

    pub fn perp(mark_price: f64, funding_rate: f64) -> Self {
        GlobalState::Perp(PerpGlobalState {
            mark_price,
            funding_rate,
        })
    }

    pub fn lending(
        notional_price: f64,
        product_price: f64,
        lending_rate: f64,
        borrowing_rate: f64,
    ) -> Self {
        GlobalState::Lending(LendingGlobalState {
            notional_price,
            product_price,
            lending_rate,
            borrowing_rate,
        })
    }

    /// Pool snapshot without TVL or volume figures.
    pub fn pool(price: f64, fees: f64, liquidity: f64) -> Self {
        GlobalState::Pool(PoolGlobalState {
            price,
            tvl: 0.0,
            volume: 0.0,
            fees,
            liquidity,
        })
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            GlobalState::Spot(_) => EntityKind::Spot,
            GlobalState::Lending(_) => EntityKind::Lending,
            GlobalState::Perp(_) => EntityKind::Perp,
            GlobalState::Pool(_) => EntityKind::Pool,
        }
    }

    /// Reject NaN/infinite fields, non-positive prices and negative pool
    /// figures.
    pub fn validate(&self, entity: &str) -> Result<(), DataError> {
        if let GlobalState::Pool(s) = self {
            for (field, value) in [
                ("tvl", s.tvl),
                ("volume", s.volume),
                ("fees", s.fees),
                ("liquidity", s.liquidity),
            ] {
                if !value.is_finite() || value < 0.0 {
                    return Err(invalid(entity, field, value));
                }
            }
        }
        let (prices, rates): (Vec<(&'static str, f64)>, Vec<(&'static str, f64)>) = match self {
            GlobalState::Spot(s) => (vec![("price", s.price)], vec![]),
            GlobalState::Pool(s) => (vec![("price", s.price)], vec![]),
            GlobalState::Lending(s) => (
                vec![
                    ("notional_price", s.notional_price),
                    ("product_price", s.product_price),
                ],
                vec![
                    ("lending_rate", s.lending_rate),
                    ("borrowing_rate", s.borrowing_rate),
                ],
            ),
            GlobalState::Perp(s) => (
                vec![("mark_price", s.mark_price)],
                vec![("funding_rate", s.funding_rate)],
            ),
        };

        for (field, value) in prices {
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid(entity, field, value));
            }
        }
        for (field, value) in rates {
            if !value.is_finite() {
                return Err(invalid(entity, field, value));
            }
        }
        Ok(())
    }
}

fn invalid(entity: &str, field: &'static str, value: f64) -> DataError {
    DataError::InvalidField {
        entity: entity.to_string(),
        field,
        value,
    }
}

// ─── Internal states ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpotInternalState {
    pub cash: f64,
    pub product: f64,
}

/// `collateral` is denominated in notional, `borrowed` in product.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LendingInternalState {
    pub collateral: f64,
    pub borrowed: f64,
}

/// Net position. Positive amount is long, negative is short.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerpPosition {
    pub amount: f64,
    pub entry_price: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerpInternalState {
    pub collateral: f64,
    pub position: Option<PerpPosition>,
}

/// LP ledger. `token0` is the notional leg, `token1` the product leg and
/// `liquidity` the position's `√(token0 · token1)`; zero means no position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolInternalState {
    pub cash: f64,
    pub token0: f64,
    pub token1: f64,
    pub liquidity: f64,
    pub entry_price: f64,
}

impl PerpInternalState {
    pub fn size(&self) -> f64 {
        self.position.map_or(0.0, |p| p.amount)
    }
}

/// Entity-owned ledger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InternalState {
    Spot(SpotInternalState),
    Lending(LendingInternalState),
    Perp(PerpInternalState),
    Pool(PoolInternalState),
}

impl InternalState {
    pub fn kind(&self) -> EntityKind {
        match self {
            InternalState::Spot(_) => EntityKind::Spot,
            InternalState::Lending(_) => EntityKind::Lending,
            InternalState::Perp(_) => EntityKind::Perp,
            InternalState::Pool(_) => EntityKind::Pool,
        }
    }

    /// Flat `(field, value)` view used for tabular artifacts.
    ///
    /// The field set is fixed per kind so every row of a run has the same
    /// columns. A perp entity without a position reports zeros.
    pub fn fields(&self) -> Vec<(&'static str, f64)> {
        match self {
            InternalState::Spot(s) => vec![("cash", s.cash), ("product", s.product)],
            InternalState::Lending(s) => {
                vec![("collateral", s.collateral), ("borrowed", s.borrowed)]
            }
            InternalState::Perp(s) => {
                let (amount, entry) = s
                    .position
                    .map_or((0.0, 0.0), |p| (p.amount, p.entry_price));
                vec![
                    ("collateral", s.collateral),
                    ("position_amount", amount),
                    ("entry_price", entry),
                ]
            }
            InternalState::Pool(s) => vec![
                ("cash", s.cash),
                ("token0", s.token0),
                ("token1", s.token1),
                ("liquidity", s.liquidity),
                ("entry_price", s.entry_price),
            ],
        }
    }
}
