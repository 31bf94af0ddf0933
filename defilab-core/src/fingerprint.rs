//! Deterministic identities for datasets and runs.
//!
//! - `dataset_hash`: content hash of an observation sequence.
//! - `run_id`: experiment name + canonical params + dataset hash.
//!
//! Both use BLAKE3 over canonical JSON (`BTreeMap` key order), so identical
//! inputs hash identically across builds and platforms.

use serde_json::json;

use crate::domain::Observation;
use crate::strategy::ParamPoint;

pub fn dataset_hash(observations: &[Observation]) -> Result<String, serde_json::Error> {
    let mut hasher = blake3::Hasher::new();
    for obs in observations {
        serde_json::to_writer(&mut hasher, obs)?;
        hasher.update(b"\n");
    }
    Ok(hasher.finalize().to_hex().to_string())
}

pub fn run_id(
    experiment: &str,
    params: &ParamPoint,
    dataset_hash: &str,
) -> Result<String, serde_json::Error> {
    let canonical = json!({
        "experiment": experiment,
        "params": params,
        "dataset_hash": dataset_hash,
    });
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GlobalState;
    use crate::strategy::params::point;
    use chrono::{TimeZone, Utc};

    fn obs(price: f64) -> Vec<Observation> {
        vec![Observation::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .with_state("S", GlobalState::spot(price))]
    }

    #[test]
    fn dataset_hash_tracks_content() {
        assert_eq!(dataset_hash(&obs(1.0)).unwrap(), dataset_hash(&obs(1.0)).unwrap());
        assert_ne!(dataset_hash(&obs(1.0)).unwrap(), dataset_hash(&obs(2.0)).unwrap());
    }

    #[test]
    fn run_id_ignores_insertion_order() {
        let a = point([("A", 1.0), ("B", 2.0)]);
        let b = point([("B", 2.0), ("A", 1.0)]);
        assert_eq!(run_id("x", &a, "d").unwrap(), run_id("x", &b, "d").unwrap());
        assert_ne!(run_id("x", &a, "d").unwrap(), run_id("y", &a, "d").unwrap());
    }
}
