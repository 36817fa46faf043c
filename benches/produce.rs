use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use relayq::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    id: u64,
    data: String,
}

#[async_trait]
impl RelayTask for Payload {
    async fn run(self) -> RelayResult<()> {
        Ok(())
    }
}

fn bench_produce(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("Failed to build runtime");
    let mut group = c.benchmark_group("produce_in_memory");

    for size in [16usize, 1024, 64 * 1024] {
        let producer = Producer::<Payload, _>::new(InMemoryBroker::new(), "memory://bench")
            .expect("Failed to create producer");
        let task = Payload {
            id: 42,
            data: "x".repeat(size),
        };

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &task, |b, task| {
            let producer = &producer;
            b.to_async(&runtime)
                .iter(move || async move { producer.produce(task).await.expect("produce failed") });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_produce);
criterion_main!(benches);
