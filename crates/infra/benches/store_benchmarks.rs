use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use taskrelay_infra::BackoffPolicy;
use taskrelay_infra::store::{Fields, InMemoryBackend, StoreBackend};

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build tokio runtime")
}

fn task_fields(n: usize) -> Fields {
    vec![
        ("task_id".to_string(), n.to_string()),
        ("task".to_string(), format!(r#"{{"task_id":{n},"payload":"bench"}}"#)),
    ]
}

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");
    let policy = BackoffPolicy::default();

    group.bench_function("base_delay", |b| {
        b.iter(|| {
            for attempt in 0..16u32 {
                black_box(policy.base_delay(black_box(attempt)));
            }
        });
    });

    group.bench_function("jittered_delay", |b| {
        b.iter(|| {
            for attempt in 0..16u32 {
                black_box(policy.delay_for_attempt(black_box(attempt)));
            }
        });
    });

    group.finish();
}

fn bench_stream_append(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("memory_stream_append");

    for batch_size in [1usize, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::new("xadd_maxlen", batch_size), &batch_size, |b, &size| {
            b.iter(|| {
                rt.block_on(async {
                    let backend = InMemoryBackend::new();
                    for n in 0..size {
                        backend
                            .xadd("task:dispatched", &task_fields(n), Some(10_000))
                            .await
                            .expect("append failed");
                    }
                });
            });
        });
    }

    group.finish();
}

fn bench_stream_range(c: &mut Criterion) {
    let rt = runtime();
    let backend = InMemoryBackend::new();
    rt.block_on(async {
        for n in 0..10_000 {
            backend
                .xadd("task:dispatched", &task_fields(n), Some(10_000))
                .await
                .expect("append failed");
        }
    });

    let mut group = c.benchmark_group("memory_stream_range");
    group.measurement_time(Duration::from_secs(5));
    for count in [1usize, 500, 1000] {
        group.bench_with_input(BenchmarkId::new("xrevrange", count), &count, |b, &count| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(
                        backend
                            .xrevrange("task:dispatched", count)
                            .await
                            .expect("range failed"),
                    )
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_backoff, bench_stream_append, bench_stream_range);
criterion_main!(benches);
