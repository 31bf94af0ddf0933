//! Seeded synthetic market data.
//!
//! Geometric Brownian motion price paths for Monte Carlo trajectories. Each
//! trajectory's RNG is seeded from a BLAKE3 hash of `(master_seed, label,
//! index)`, so trajectory `k` is identical regardless of how many trajectories
//! are generated or in which order.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::domain::{GlobalState, Observation};
use crate::error::ConfigError;
use crate::metrics::SECONDS_PER_YEAR;

/// GBM parameters. `drift` and `volatility` are annualized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbmParams {
    pub initial_price: f64,
    pub drift: f64,
    pub volatility: f64,
    pub step_seconds: i64,
}

impl GbmParams {
    pub fn hourly(initial_price: f64, drift: f64, volatility: f64) -> Self {
        Self {
            initial_price,
            drift,
            volatility,
            step_seconds: 3_600,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("initial_price", self.initial_price, self.initial_price > 0.0),
            ("volatility", self.volatility, self.volatility >= 0.0),
            ("drift", self.drift, self.drift.is_finite()),
            ("step_seconds", self.step_seconds as f64, self.step_seconds > 0),
        ];
        for (name, value, ok) in checks {
            if !ok || !value.is_finite() {
                return Err(ConfigError::OutOfRange {
                    name: name.into(),
                    value,
                    reason: "invalid GBM parameter".into(),
                });
            }
        }
        Ok(())
    }
}

/// Deterministic per-trajectory seed.
pub fn trajectory_seed(master_seed: u64, label: &str, index: u64) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&master_seed.to_le_bytes());
    hasher.update(label.as_bytes());
    hasher.update(&index.to_le_bytes());
    let hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// `steps` prices starting at `initial_price`.
pub fn gbm_path(params: &GbmParams, steps: usize, rng: &mut StdRng) -> Vec<f64> {
    let dt = params.step_seconds as f64 / SECONDS_PER_YEAR;
    let drift = (params.drift - 0.5 * params.volatility.powi(2)) * dt;
    let diffusion = params.volatility * dt.sqrt();

    let mut prices = Vec::with_capacity(steps);
    let mut price = params.initial_price;
    for i in 0..steps {
        if i > 0 {
            let z: f64 = rng.sample(StandardNormal);
            price *= (drift + diffusion * z).exp();
        }
        prices.push(price);
    }
    prices
}

/// `count` independent GBM paths.
pub fn gbm_trajectories(
    params: &GbmParams,
    steps: usize,
    count: usize,
    master_seed: u64,
) -> Result<Vec<Vec<f64>>, ConfigError> {
    params.validate()?;
    Ok((0..count as u64)
        .map(|k| {
            let mut rng = StdRng::seed_from_u64(trajectory_seed(master_seed, "gbm", k));
            gbm_path(params, steps, &mut rng)
        })
        .collect())
}

/// One spot observation per price.
pub fn spot_observations(
    entity: &str,
    start: DateTime<Utc>,
    step: Duration,
    prices: &[f64],
) -> Vec<Observation> {
    prices
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            Observation::new(start + step * i as i32).with_state(entity, GlobalState::spot(p))
        })
        .collect()
}

/// Spot and perp observations sharing one price path, with a constant
/// per-step funding rate on the perp.
pub fn basis_observations(
    spot: &str,
    perp: &str,
    start: DateTime<Utc>,
    step: Duration,
    prices: &[f64],
    funding_rate: f64,
) -> Vec<Observation> {
    prices
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            Observation::new(start + step * i as i32)
                .with_state(spot, GlobalState::spot(p))
                .with_state(perp, GlobalState::perp(p, funding_rate))
        })
        .collect()
}
