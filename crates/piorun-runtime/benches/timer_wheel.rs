//! Timer wheel and context switch benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use piorun_runtime::event_loop::{run_until_idle, spawn_local};
use piorun_runtime::this_fiber;
use piorun_runtime::timer::{LinkId, TimeoutItem, TimeoutSlab, TimerWheel};

/// File `n` timeouts spread over the wheel, then harvest them all.
fn bench_add_and_take(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer_wheel/add_take");

    for n in [64usize, 1024, 16 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let mut slab: TimeoutSlab<u64> = TimeoutSlab::new();
            let mut wheel = TimerWheel::new(&mut slab, 60 * 1000);
            let out: LinkId = slab.new_link();
            let mut now = 1_000u64;

            b.iter(|| {
                for i in 0..n as u64 {
                    let key = slab.insert(TimeoutItem::new(now + 1 + i % 500, i));
                    let _ = wheel.add_timeout(&mut slab, key, now);
                }
                now += 501;
                wheel.take_all_timeout(&mut slab, now, out);
                while let Some(key) = slab.pop_front(out) {
                    black_box(slab.remove(key));
                }
            })
        });
    }
    group.finish();
}

/// Two fibers yielding to each other through the event loop.
fn bench_yield_ping_pong(c: &mut Criterion) {
    c.bench_function("fiber/yield_ping_pong_1000", |b| {
        b.iter(|| {
            for _ in 0..2 {
                spawn_local(|| {
                    for _ in 0..1000 {
                        this_fiber::yield_now();
                    }
                });
            }
            run_until_idle();
        })
    });
}

criterion_group!(benches, bench_add_and_take, bench_yield_ping_pong);
criterion_main!(benches);
