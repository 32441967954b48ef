// SPDX-License-Identifier: Apache-2.0

//! Benchmarks the gauge kernel's defining contract: `run(n)` is linear in
//! `n`, with no fixed per-call overhead large enough to bend the curve at
//! the sizes the calibration loop actually probes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use partes_gauge::{FmaScalar, Gauge, SubScalar};

fn bench_linearity(c: &mut Criterion) {
    let mut group = c.benchmark_group("gauge_linearity");
    for n in [1_000_i64, 10_000, 100_000, 1_000_000] {
        group.bench_with_input(BenchmarkId::new("sub_scalar", n), &n, |b, &n| {
            let gauge = SubScalar;
            b.iter(|| gauge.run(n));
        });
        group.bench_with_input(BenchmarkId::new("fma_scalar", n), &n, |b, &n| {
            let gauge = FmaScalar;
            b.iter(|| gauge.run(n));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_linearity);
criterion_main!(benches);
