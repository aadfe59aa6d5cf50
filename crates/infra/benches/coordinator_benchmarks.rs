use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use relq_core::{Job, NodeId, QueueName};
use relq_infra::coordinator::{Coordinator, CoordinatorConfig, RunningCoordinator};
use relq_infra::store::InMemoryStore;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);
const QUEUE_KEY: &str = "queue:bench";

fn start(store: &InMemoryStore) -> RunningCoordinator {
    let config = CoordinatorConfig::new(
        QueueName::new("bench").unwrap(),
        NodeId::new("bench-node").unwrap(),
    );
    Coordinator::start(config, store.clone()).unwrap()
}

fn fill(store: &InMemoryStore, n: usize) {
    let queue = QueueName::new("bench").unwrap();
    for i in 0..n {
        let job = Job::new(&queue, "Bench", vec![i.into()]).seal().unwrap();
        store.push(QUEUE_KEY, job.original_json());
    }
}

/// Dequeue followed by ack: the happy path of every job.
fn bench_dequeue_ack_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("dequeue_ack_round_trip");

    for batch in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |b, &batch| {
            let store = InMemoryStore::new();
            let running = start(&store);
            let handle = running.handle();

            b.iter(|| {
                fill(&store, batch);
                let raw = handle.dequeue(batch, TIMEOUT).unwrap();
                for entry in raw {
                    handle.ack(&Job::decode(entry).unwrap());
                }
                // Flush the acks before the next iteration.
                black_box(handle.dequeue(0, TIMEOUT).unwrap());
            });

            running.shutdown().unwrap();
        });
    }

    group.finish();
}

/// Returning a crashed node's in-progress list to the queue.
fn bench_recovery_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery_drain");
    group.sample_size(20);

    for stranded in [100usize, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*stranded as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(stranded),
            stranded,
            |b, &stranded| {
                let store = InMemoryStore::new();
                for i in 0..stranded {
                    store.push("inprogress:bench:bench-node", format!("e{i}"));
                }
                let running = start(&store);
                let handle = running.handle();

                b.iter(|| {
                    while !handle.enqueue_inprogress(TIMEOUT).unwrap().is_done() {}
                    black_box(store.list_len(QUEUE_KEY));
                    // Strand everything again for the next iteration.
                    while !handle.dequeue(100, TIMEOUT).unwrap().is_empty() {}
                });

                running.shutdown().unwrap();
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_dequeue_ack_round_trip, bench_recovery_drain);
criterion_main!(benches);
