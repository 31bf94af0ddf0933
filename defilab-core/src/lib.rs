//! defilab core: entities, observations, strategy state machine, metrics.
//!
//! This crate contains the simulation engine:
//! - Entity state model (spot, lending, perp, pool) behind one `Entity` trait
//! - Observation feed and windowed, no-lookahead storage
//! - `Simulation`: set up, step through observations, record, finalize
//! - Pure metric functions over the recorded equity curve
//! - Reference strategies and seeded synthetic data

pub mod domain;
pub mod entity;
pub mod error;
pub mod fingerprint;
pub mod metrics;
pub mod storage;
pub mod strategies;
pub mod strategy;
pub mod synthetic;

pub use error::{ConfigError, DataError, DomainError, EngineError};
