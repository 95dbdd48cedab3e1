use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use keyrouter::core::sliding_window::SlidingWindowCounter;
use keyrouter::core::telemetry::{ClickKind, Telemetry};

const WINDOW: Duration = Duration::from_secs(60);

fn filled(clicks: usize) -> SlidingWindowCounter<ClickKind> {
    let counter = SlidingWindowCounter::new(WINDOW);
    for i in 0..clicks {
        let kind = if i % 2 == 0 {
            ClickKind::Posted
        } else {
            ClickKind::Processed
        };
        counter.click(kind, 1);
    }
    counter
}

fn bench_click(c: &mut Criterion) {
    let mut group = c.benchmark_group("sliding_window_click");
    group.throughput(Throughput::Elements(1));
    group.bench_function("single_producer", |b| {
        let counter = SlidingWindowCounter::new(WINDOW);
        b.iter(|| counter.click(black_box(ClickKind::Posted), 1));
    });

    for &producers in [2usize, 4, 8].iter() {
        group.throughput(Throughput::Elements(producers as u64 * 1_000));
        group.bench_with_input(
            BenchmarkId::new("contended", producers),
            &producers,
            |b, &producers| {
                b.iter(|| {
                    let counter = Arc::new(SlidingWindowCounter::new(WINDOW));
                    let handles: Vec<_> = (0..producers)
                        .map(|_| {
                            let counter = Arc::clone(&counter);
                            thread::spawn(move || {
                                for _ in 0..1_000 {
                                    counter.click(ClickKind::Posted, 1);
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    black_box(counter.count(WINDOW))
                });
            },
        );
    }
    group.finish();
}

fn bench_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("sliding_window_read");
    for &size in [1_000usize, 10_000, 100_000].iter() {
        let counter = filled(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("sum", size), &size, |b, _| {
            b.iter(|| black_box(counter.sum(WINDOW, ClickKind::Posted)));
        });
        group.bench_with_input(BenchmarkId::new("snapshot", size), &size, |b, _| {
            b.iter(|| black_box(counter.snapshot(WINDOW).len()));
        });
    }
    group.finish();
}

fn bench_trim_rollup(c: &mut Criterion) {
    c.bench_function("telemetry_record_and_trim_10k", |b| {
        b.iter(|| {
            let telemetry = Telemetry::new();
            for _ in 0..10_000 {
                telemetry.record(ClickKind::Processed, 1);
            }
            telemetry.trim();
            black_box(telemetry.last_hour(ClickKind::Processed))
        });
    });
}

criterion_group!(benches, bench_click, bench_reads, bench_trim_rollup);
criterion_main!(benches);
