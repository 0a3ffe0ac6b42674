use artik_loop_bridge::{
    EventLoop, HostLoop, LoopBridge, MainContext, RunMode, Trampoline, WakeStrategy,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn create_bridge() -> (Arc<EventLoop>, Arc<LoopBridge>) {
    let event_loop = Arc::new(EventLoop::new());
    let host: Arc<dyn HostLoop> = Arc::clone(&event_loop) as Arc<dyn HostLoop>;
    let bridge = LoopBridge::new(host, Arc::new(MainContext::new()), WakeStrategy::BusyPoll);
    (event_loop, bridge)
}

/// Benchmark the 0 -> 1 -> 0 registration cycle against a nested attach
fn bench_attach_detach(c: &mut Criterion) {
    let mut group = c.benchmark_group("attach_detach");

    group.bench_function("register_cycle", |b| {
        let (_event_loop, bridge) = create_bridge();
        b.iter(|| {
            bridge.attach();
            bridge.detach();
        });
    });

    group.bench_function("nested_reference", |b| {
        let (_event_loop, bridge) = create_bridge();
        bridge.attach();
        b.iter(|| {
            bridge.attach();
            bridge.detach();
        });
        bridge.detach();
    });

    group.finish();
}

/// Benchmark delivering a batch of events through one host-loop tick
fn bench_event_delivery(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_delivery");

    for batch in [1usize, 16, 256] {
        group.throughput(Throughput::Elements(batch as u64));

        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let (event_loop, bridge) = create_bridge();
            let _guard = bridge.guard();
            let received = Arc::new(AtomicU64::new(0));

            let r = Arc::clone(&received);
            let (_trampoline, sender) = Trampoline::register(bridge.context(), batch, move |v: u64| {
                r.fetch_add(v, Ordering::Relaxed);
            });

            b.iter(|| {
                for value in 0..batch as u64 {
                    sender.send(black_box(value));
                }
                // Budget may split a large batch over several ticks
                while bridge.context().pending() {
                    event_loop.run(RunMode::NoWait);
                }
            });

            black_box(received.load(Ordering::Relaxed));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_attach_detach, bench_event_delivery);
criterion_main!(benches);
