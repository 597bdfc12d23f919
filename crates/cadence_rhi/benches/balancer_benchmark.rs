//! # Balancer Benchmark
//!
//! Partitioning runs on the producer for every parallel submission, so it has
//! to stay in the low microseconds even for wide submissions.
//!
//! Run with: `cargo bench --package cadence_rhi --bench balancer_benchmark`

#![allow(missing_docs)]

use cadence_rhi::{plan_by_memory, plan_translate_groups, BalanceThresholds, Tunables, Workload};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn workloads(count: usize) -> Vec<Workload> {
    (0..count)
        .map(|index| match index % 7 {
            0 => Workload::Unknown,
            n => Workload::Known((n as u32) * 13),
        })
        .collect()
}

fn bench_plan_by_draws(c: &mut Criterion) {
    let thresholds = BalanceThresholds::from_tunables(&Tunables::default());
    let mut group = c.benchmark_group("plan_translate_groups");

    for count in [8usize, 64, 512] {
        let input = workloads(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &input, |b, input| {
            b.iter(|| black_box(plan_translate_groups(black_box(input), &thresholds)));
        });
    }

    group.finish();
}

fn bench_plan_by_memory(c: &mut Criterion) {
    let thresholds = BalanceThresholds::by_memory(&Tunables::default());
    let sizes: Vec<usize> = (0..256).map(|index| 1024 + (index * 977) % 40_000).collect();

    c.bench_function("plan_by_memory_256", |b| {
        b.iter(|| black_box(plan_by_memory(black_box(&sizes), &thresholds)));
    });
}

criterion_group!(benches, bench_plan_by_draws, bench_plan_by_memory);
criterion_main!(benches);
