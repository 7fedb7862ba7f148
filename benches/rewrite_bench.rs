//! Benchmarks for the Rewriter's cache-scan (clause-by-clause temp-table
//! substitution attempt against an increasingly long MRU candidate list).
//! All operations are pure Rust — no warehouse required.
//!
//! Run with: `cargo bench --bench rewrite_bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use speql::pool::{CreateMetrics, TempTablePool};
use speql::rewriter::rewrite;

const CURSOR: &str = "/*CURSOR_IDENTIFIER*/";

fn pool_with_candidates(n: usize) -> (TempTablePool, Vec<String>) {
    let mut pool = TempTablePool::new("speql", n + 1, u64::MAX);
    let mut candidates = Vec::with_capacity(n);
    for i in 0..n {
        let script = format!("SELECT A.X AS X FROM TABLE_{i} AS A WHERE A.X > 0");
        pool.update(&script, false, CreateMetrics::default());
        candidates.push(script);
    }
    (pool, candidates)
}

fn bench_rewrite_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("rewrite_cache_scan");
    for &n in &[1usize, 8, 32, 128] {
        let (pool, candidates) = pool_with_candidates(n);
        let target = format!("SELECT A.X AS X FROM TABLE_{} AS A WHERE A.X > 0 AND A.Y < 5", n.saturating_sub(1));

        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| rewrite(black_box(&pool), black_box(&candidates), black_box(&target), CURSOR));
        });
    }
    group.finish();
}

fn bench_rewrite_no_match(c: &mut Criterion) {
    let (pool, candidates) = pool_with_candidates(32);
    let target = "SELECT B.Z AS Z FROM UNRELATED AS B";

    c.bench_function("rewrite_cache_scan_no_match", |b| {
        b.iter(|| rewrite(black_box(&pool), black_box(&candidates), black_box(target), CURSOR));
    });
}

criterion_group!(benches, bench_rewrite_scan, bench_rewrite_no_match);
criterion_main!(benches);
