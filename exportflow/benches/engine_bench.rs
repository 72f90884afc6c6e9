//! Benchmarks for retry delays and state store throughput.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use exportflow::context::PipelineContext;
use exportflow::pipeline::RetryPolicy;
use exportflow::store::{InMemoryKeyValue, InMemoryStateStore, StateStore, TtlStateStore};
use std::sync::Arc;
use std::time::Duration;

fn retry_benchmark(c: &mut Criterion) {
    let fixed = RetryPolicy::default();
    let jittered = RetryPolicy::default().with_jitter(0.2);

    c.bench_function("retry_decide_fixed", |b| {
        b.iter(|| fixed.decide(black_box(2), 3, true));
    });
    c.bench_function("retry_decide_jittered", |b| {
        b.iter(|| jittered.decide(black_box(2), 3, true));
    });
}

fn store_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let ctx = PipelineContext::new("bench", "form-1", "google_forms", 3);

    let memory = InMemoryStateStore::new();
    c.bench_function("memory_store_save_get", |b| {
        b.iter(|| {
            runtime.block_on(async {
                memory.save(&ctx).await.unwrap();
                black_box(memory.get(ctx.id).await.unwrap());
            });
        });
    });

    let ttl = TtlStateStore::new(Arc::new(InMemoryKeyValue::new()), Duration::from_secs(3600));
    c.bench_function("ttl_store_save_get", |b| {
        b.iter(|| {
            runtime.block_on(async {
                ttl.save(&ctx).await.unwrap();
                black_box(ttl.get(ctx.id).await.unwrap());
            });
        });
    });

    runtime.block_on(async {
        for i in 0..500 {
            let owner = if i % 10 == 0 { "target" } else { "other" };
            memory
                .save(&PipelineContext::new(owner, format!("form-{i}"), "typeform", 3))
                .await
                .unwrap();
        }
    });
    c.bench_function("memory_store_scan_by_owner", |b| {
        b.iter(|| runtime.block_on(memory.scan_by_owner(black_box("target"), 20)).unwrap());
    });
}

criterion_group!(benches, retry_benchmark, store_benchmark);
criterion_main!(benches);
