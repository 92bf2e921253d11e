use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tessel_core::Value;
use tessel_tests::*;

fn fib_20_wasm_bench(c: &mut Criterion) {
    let mut m = instantiate(FIB);
    c.bench_function("fib 20 interpreted", |b| {
        b.iter(|| call_i32(&mut m, "fib", &[Value::I32(black_box(20))]))
    });
}

fn fib_20_native_bench(c: &mut Criterion) {
    c.bench_function("fib 20 native", |b| b.iter(|| fib_native(black_box(20))));
}

// ─── Memory-intensive benchmarks ─────────────────────────────────────────────

fn fill_sum_4k_wasm_bench(c: &mut Criterion) {
    let mut m = instantiate(FIB);
    c.bench_function("fill/sum 4096 bytes interpreted", |b| {
        b.iter(|| call_i32(&mut m, "fill_sum", &[Value::I32(black_box(4096))]))
    });
}

fn fill_sum_4k_native_bench(c: &mut Criterion) {
    c.bench_function("fill/sum 4096 bytes native", |b| {
        b.iter(|| fill_sum_native(black_box(4096)))
    });
}

// ─── Setup cost ──────────────────────────────────────────────────────────────

fn instantiate_bench(c: &mut Criterion) {
    let module = load(FIB);
    let host = tessel_core::Host::default();
    let imports = tessel_core::Imports::new();
    c.bench_function("instantiate fib module", |b| {
        b.iter(|| host.instantiate(black_box(&module), &imports))
    });
}

criterion_group!(
    benches,
    fib_20_wasm_bench,
    fib_20_native_bench,
    fill_sum_4k_wasm_bench,
    fill_sum_4k_native_bench,
    instantiate_bench
);
criterion_main!(benches);
