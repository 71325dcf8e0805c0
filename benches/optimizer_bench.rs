//! Performance benchmarks for the optimizer.
//!
//! Run with: cargo bench

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sieve::analytics::StandardMetrics;
use sieve::coverage::{schedule, CoverageConfig};
use sieve::orchestrator::{Budget, OrchestratorConfig, RunContext, TrialOrchestrator};
use sieve::ranking::{non_dominated_sort, rank_trials};
use sieve::simulator::{Backtester, SmaCrossSimulator};
use sieve::space::{metric, ObjectiveSpec, ParamSet, ParamSpec, SearchSpace};
use sieve::study::{Trial, TrialOrigin, TrialState};
use sieve::types::{Bar, MetricMap};
use std::sync::Arc;

/// Generate synthetic bars for benchmarking.
fn generate_bars(count: usize) -> Vec<Bar> {
    let mut price = 100.0;
    (0..count)
        .map(|i| {
            let noise = ((i as f64 * 0.7).sin() * 2.0 + (i as f64 * 1.3).cos()) * 0.5;
            price += 0.001 * price + noise;
            price = price.max(50.0);

            Bar::new(
                Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::days(i as i64),
                price - 1.0,
                price + 2.0,
                price - 2.0,
                price + 0.5,
                1_000_000.0,
            )
        })
        .collect()
}

fn multi_space() -> SearchSpace {
    SearchSpace::new(vec![
        ParamSpec::int("fast_period", 5, 30, 1),
        ParamSpec::int("slow_period", 40, 120, 5),
        ParamSpec::float("threshold", 0.0, 1.0, None),
        ParamSpec::categorical("direction", &["long", "both"]),
    ])
    .with_objective(ObjectiveSpec::new(metric::SHARPE_RATIO))
    .with_objective(ObjectiveSpec::new(metric::MAX_DRAWDOWN_PCT))
    .with_primary(metric::SHARPE_RATIO)
}

/// Deterministic pseudo-random objective vectors.
fn synthetic_trials(count: usize) -> Vec<Trial> {
    (0..count)
        .map(|i| {
            let x = i as f64;
            Trial {
                number: i as u64,
                params: ParamSet::new(),
                metrics: MetricMap::new(),
                values: Some(vec![(x * 0.37).sin() * 2.0, (x * 0.11).cos().abs() * 30.0]),
                constraint_violations: Some(vec![if i % 7 == 0 { 1.0 } else { 0.0 }]),
                state: TrialState::Complete,
                sanitized_metrics: Vec::new(),
                origin: TrialOrigin::Sampler,
                failure: None,
            }
        })
        .collect()
}

/// Benchmark the coverage scheduler.
fn bench_coverage(c: &mut Criterion) {
    let space = multi_space();
    let mut group = c.benchmark_group("coverage");

    for n in [16, 64, 256].iter() {
        group.bench_with_input(BenchmarkId::new("schedule", n), n, |b, &n| {
            let config = CoverageConfig::new(n);
            b.iter(|| schedule(black_box(&space), &config))
        });
    }

    group.finish();
}

/// Benchmark ranking and non-dominated sorting.
fn bench_ranking(c: &mut Criterion) {
    let space = multi_space();
    let directions = space.directions();
    let mut group = c.benchmark_group("ranking");

    for n in [100, 500, 1000].iter() {
        let trials = synthetic_trials(*n);
        group.bench_with_input(BenchmarkId::new("rank_trials", n), &trials, |b, trials| {
            b.iter(|| rank_trials(black_box(&space), black_box(trials)))
        });

        let points: Vec<&[f64]> = trials.iter().filter_map(|t| t.values.as_deref()).collect();
        group.bench_with_input(BenchmarkId::new("non_dominated_sort", n), &points, |b, points| {
            b.iter(|| non_dominated_sort(&directions, black_box(points)))
        });
    }

    group.finish();
}

/// Benchmark a complete small optimization run.
fn bench_optimization(c: &mut Criterion) {
    let bars = generate_bars(1000);
    let backtester = Backtester::new(
        Arc::new(SmaCrossSimulator::new(10_000.0)),
        Arc::new(StandardMetrics::default()),
        10_000.0,
    );

    let mut group = c.benchmark_group("optimization");
    group.sample_size(10);

    group.bench_function("tpe_50_trials", |b| {
        b.iter(|| {
            let config = OrchestratorConfig::default()
                .with_budget(Budget::trials(50))
                .with_coverage(CoverageConfig::new(10))
                .with_warmup(120);
            TrialOrchestrator::new(multi_space(), config, backtester.clone()).run(black_box(&bars), &RunContext::new())
        })
    });

    group.finish();
}

criterion_group!(benches, bench_coverage, bench_ranking, bench_optimization);
criterion_main!(benches);
