use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};

use piggytxn::processor::{Mode, ProcessorConfig, TxnProcessor};
use piggytxn::workload::{LoadGen, RmwLoadGen};

fn commit_throughput(c: &mut Criterion) {
    for mode in Mode::ALL {
        let processor = TxnProcessor::with_config(
            mode,
            ProcessorConfig {
                threads: 8,
                db_size: 10_000,
            },
        )
        .unwrap();
        let mut gen = RmwLoadGen::seeded(10_000, 2, 2, Duration::ZERO, 7);

        c.bench_function(&format!("submit and commit/{mode}"), |b| {
            b.iter(|| {
                processor.submit(gen.next_txn()).unwrap();
                processor.next_result().unwrap()
            })
        });
    }
}

criterion_group!(
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = commit_throughput
);
criterion_main!(benches);
