//! Hyperparameter records.
//!
//! A grid point is a flat `name → value` map. Each strategy turns a point into
//! its own immutable params struct, validating ranges and cross-field
//! invariants in the constructor.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ConfigError;

/// One grid point. `BTreeMap` keeps serialization (and run ids) stable.
pub type ParamPoint = BTreeMap<String, f64>;

pub trait StrategyParams: Clone + fmt::Debug + Serialize + Send + Sync + Sized {
    /// Build and validate. Invalid points never reach a simulation.
    fn from_point(point: &ParamPoint) -> Result<Self, ConfigError>;

    fn to_point(&self) -> ParamPoint;
}

pub fn require(point: &ParamPoint, name: &str) -> Result<f64, ConfigError> {
    point
        .get(name)
        .copied()
        .ok_or_else(|| ConfigError::MissingParam(name.to_string()))
}

pub fn get_or(point: &ParamPoint, name: &str, default: f64) -> f64 {
    point.get(name).copied().unwrap_or(default)
}

/// Fail with `OutOfRange` unless `ok` holds.
pub fn ensure(ok: bool, name: &str, value: f64, reason: &str) -> Result<(), ConfigError> {
    if ok && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name: name.to_string(),
            value,
            reason: reason.to_string(),
        })
    }
}

pub fn ensure_positive(name: &str, value: f64) -> Result<(), ConfigError> {
    ensure(value > 0.0, name, value, "must be > 0")
}

/// `[0, 1)`, the valid range for a fee rate.
pub fn ensure_fee(name: &str, value: f64) -> Result<(), ConfigError> {
    ensure((0.0..1.0).contains(&value), name, value, "must be in [0, 1)")
}

/// Build a point from literal pairs.
pub fn point<const N: usize>(pairs: [(&str, f64); N]) -> ParamPoint {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_param_named() {
        let p = point([("A", 1.0)]);
        assert_eq!(
            require(&p, "B"),
            Err(ConfigError::MissingParam("B".into()))
        );
        assert_eq!(require(&p, "A"), Ok(1.0));
    }

    #[test]
    fn nan_never_passes() {
        assert!(ensure(true, "X", f64::NAN, "finite").is_err());
    }

    #[test]
    fn fee_range() {
        assert!(ensure_fee("FEE", 0.0).is_ok());
        assert!(ensure_fee("FEE", 1.0).is_err());
        assert!(ensure_fee("FEE", -0.1).is_err());
    }
}
