//! Criterion benchmarks for the simulation hot paths.
//!
//! Benchmarks:
//! 1. Full basis-strategy run over synthetic hourly data
//! 2. Registry observation push + action routing
//! 3. Metric computation over long equity curves

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use chrono::{Duration, TimeZone, Utc};
use defilab_core::domain::{Action, ActionToTake};
use defilab_core::entity::{EntityRegistry, PerpEntity, SpotEntity};
use defilab_core::metrics::StrategyMetrics;
use defilab_core::strategies::basis::{HEDGE, SPOT};
use defilab_core::strategies::{BasisParams, BasisStrategy};
use defilab_core::strategy::params::point;
use defilab_core::strategy::{Simulation, StrategyParams};
use defilab_core::synthetic::{basis_observations, gbm_trajectories, GbmParams};

// ── Helpers ──────────────────────────────────────────────────────────

fn observations(n: usize) -> Vec<defilab_core::domain::Observation> {
    let prices = gbm_trajectories(&GbmParams::hourly(2_000.0, 0.0, 0.8), n, 1, 42)
        .unwrap()
        .remove(0);
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    basis_observations(SPOT, HEDGE, t0, Duration::hours(1), &prices, 0.00001)
}

fn basis_params() -> BasisParams {
    BasisParams::from_point(&point([
        ("MIN_LEVERAGE", 1.0),
        ("TARGET_LEVERAGE", 3.0),
        ("MAX_LEVERAGE", 6.0),
    ]))
    .unwrap()
}

// ── 1. Full run ──────────────────────────────────────────────────────

fn bench_basis_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("basis_run");
    for n in [1_000usize, 10_000] {
        let obs = observations(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &obs, |b, obs| {
            b.iter(|| {
                let mut sim = Simulation::new(BasisStrategy::new(basis_params()));
                black_box(sim.run(black_box(obs)).unwrap())
            })
        });
    }
    group.finish();
}

// ── 2. Registry ──────────────────────────────────────────────────────

fn bench_registry_step(c: &mut Criterion) {
    let obs = observations(1_000);
    c.bench_function("registry_apply_and_execute", |b| {
        b.iter(|| {
            let mut reg = EntityRegistry::new();
            reg.register(SPOT, Box::new(SpotEntity::new(0.001))).unwrap();
            reg.register(HEDGE, Box::new(PerpEntity::default())).unwrap();
            reg.execute(&ActionToTake::new(SPOT, Action::deposit(1e9)))
                .unwrap();
            for o in &obs {
                reg.apply_observation(o).unwrap();
                let _ = reg.execute(&ActionToTake::new(SPOT, Action::buy(10.0)));
                black_box(reg.portfolio_value());
            }
        })
    });
}

// ── 3. Metrics ───────────────────────────────────────────────────────

fn bench_metrics(c: &mut Criterion) {
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let n = 100_000;
    let timestamps: Vec<_> = (0..n).map(|i| t0 + Duration::hours(i as i64)).collect();
    let values: Vec<f64> = (0..n)
        .map(|i| 1_000_000.0 + (i as f64 * 0.01).sin() * 10_000.0)
        .collect();
    c.bench_function("metrics_100k", |b| {
        b.iter(|| StrategyMetrics::compute(black_box(&timestamps), black_box(&values)))
    });
}

criterion_group!(benches, bench_basis_run, bench_registry_step, bench_metrics);
criterion_main!(benches);
