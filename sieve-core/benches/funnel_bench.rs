//! Criterion benchmarks for the session pipeline hot paths.
//!
//! Benchmarks:
//! 1. Full funnel over a 5,000-instrument synthetic universe
//! 2. Stage 1 screen alone
//! 3. Refiner pass over a 200-instrument shortlist

use std::sync::Arc;

use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use sieve_core::data::synthetic::synthetic_universe;
use sieve_core::data::MemorySource;
use sieve_core::domain::SessionId;
use sieve_core::funnel::{static_attrs, FunnelConfig, FunnelFilter};
use sieve_core::refiner::{RefinerConfig, TickRefiner};
use sieve_core::rng::SeedHierarchy;

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 15).unwrap_or_default()
}

fn seeds() -> SeedHierarchy {
    SeedHierarchy::new(42, SessionId::derive(date(), 42))
}

fn bench_funnel(c: &mut Criterion) {
    let mut group = c.benchmark_group("funnel");
    group.sample_size(10);
    for size in [1_000usize, 5_000] {
        let config = FunnelConfig {
            synthetic_universe_size: size,
            ..FunnelConfig::default()
        };
        let filter =
            FunnelFilter::new(config, Arc::new(MemorySource::empty()), seeds(), date()).unwrap();
        group.bench_with_input(BenchmarkId::new("synthetic", size), &size, |b, _| {
            b.iter(|| black_box(filter.run()))
        });
    }
    group.finish();
}

fn bench_stage1(c: &mut Criterion) {
    let universe = synthetic_universe(&seeds(), 5_000);
    c.bench_function("stage1_screen_5000", |b| {
        b.iter(|| black_box(static_attrs::run(&universe)))
    });
}

fn bench_refiner(c: &mut Criterion) {
    let config = FunnelConfig {
        volume_ratio_floor: 0.0,
        ..FunnelConfig::default()
    };
    let filter =
        FunnelFilter::new(config, Arc::new(MemorySource::empty()), seeds(), date()).unwrap();
    let shortlist = filter.run().outcome.candidates().to_vec();
    let refiner = TickRefiner::new(
        RefinerConfig::default(),
        Arc::new(MemorySource::empty()),
        seeds(),
        date(),
    )
    .unwrap();

    let mut group = c.benchmark_group("refiner");
    group.sample_size(10);
    group.bench_function("synthetic_shortlist", |b| {
        b.iter(|| black_box(refiner.refine(&shortlist, None)))
    });
    group.finish();
}

criterion_group!(benches, bench_funnel, bench_stage1, bench_refiner);
criterion_main!(benches);
