//! Benchmarks for the Temporary-Table Pool's hot path: `check` (MRU lookup
//! and promotion) and `update` + `plan_eviction` under a steady-state churn
//! of scripts at varying pool sizes.
//!
//! Run with: `cargo bench --bench pool_bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use speql::pool::{CreateMetrics, TempTablePool};

fn filled_pool(count_cap: usize, n: usize) -> TempTablePool {
    let mut pool = TempTablePool::new("speql", count_cap, u64::MAX);
    for i in 0..n {
        pool.update(&format!("script_{i}"), false, CreateMetrics {
            create_size_bytes: 1024,
            ..Default::default()
        });
    }
    pool
}

fn bench_check_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_check_hit");
    for &n in &[8usize, 64, 512] {
        let mut pool = filled_pool(n + 1, n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let script = format!("script_{}", n / 2);
            b.iter(|| black_box(pool.check(black_box(&script), true)));
        });
    }
    group.finish();
}

fn bench_update_with_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_update_with_eviction");
    for &cap in &[4usize, 32, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(cap), &cap, |b, &cap| {
            b.iter_batched(
                || TempTablePool::new("speql", cap, u64::MAX),
                |mut pool| {
                    for i in 0..(cap * 4) {
                        pool.update(&format!("script_{i}"), false, CreateMetrics {
                            create_size_bytes: 1024,
                            ..Default::default()
                        });
                        let plan = pool.plan_eviction();
                        for name in &plan.to_drop {
                            pool.confirm_dropped(name);
                        }
                    }
                    black_box(pool.len());
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_check_hit, bench_update_with_eviction);
criterion_main!(benches);
