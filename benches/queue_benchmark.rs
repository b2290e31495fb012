//! Benchmarks for the command queue and the wire formats.

use std::sync::Arc;
use std::thread;

use cluster_worker::worker::{
    CommandQueue, ForkRequest, IpcMessage, ServerStats, WorkerCommand, status_line,
};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

fn bench_queue_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_push_pop");

    for batch in [1usize, 16, 256].iter() {
        group.bench_with_input(BenchmarkId::new("same_thread", batch), batch, |b, &batch| {
            let queue = CommandQueue::for_worker(true);
            b.iter(|| {
                for idx in 0..batch {
                    queue.push(WorkerCommand::Spawn(idx + 1));
                }
                for _ in 0..batch {
                    let (command, _guard) = queue.pop();
                    black_box(command);
                }
            });
        });
    }

    group.bench_function("cross_thread_256", |b| {
        b.iter(|| {
            let queue = Arc::new(CommandQueue::for_worker(true));
            let producer = {
                let queue = queue.clone();
                thread::spawn(move || {
                    for idx in 0..256 {
                        queue.push(WorkerCommand::Spawn(idx + 1));
                    }
                })
            };
            for _ in 0..256 {
                let (command, _guard) = queue.pop();
                black_box(command);
            }
            producer.join().unwrap();
        });
    });

    group.finish();
}

fn bench_wire_formats(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire");

    let stats = ServerStats {
        backlog: 3,
        running: 5,
        pool_capacity: 2,
        max_threads: 5,
        requests_count: 123_456,
    };
    group.bench_function("status_line", |b| {
        b.iter(|| status_line(black_box(4242), black_box(&stats)).unwrap());
    });

    group.bench_function("boot_line", |b| {
        let message = IpcMessage::Boot {
            pid: 4242,
            index: 7,
        };
        b.iter(|| black_box(message).to_line());
    });

    for line in ["-1", "0", "17", "bogus"].iter() {
        group.bench_with_input(BenchmarkId::new("fork_request", line), line, |b, line| {
            b.iter(|| {
                let _ = black_box(ForkRequest::parse(black_box(line)));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_queue_push_pop, bench_wire_formats);
criterion_main!(benches);
