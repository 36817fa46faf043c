use relayq::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    name: String,
}

#[async_trait]
impl RelayTask for Hello {
    async fn run(self) -> RelayResult<()> {
        println!("👋 Hello, {}!", self.name);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> RelayResult<()> {
    let config = RelayConfig {
        broker: BrokerConfig::new("memory://hello"),
        ..RelayConfig::development()
    };
    init_logging(&config.logging);

    let broker = InMemoryBroker::new();

    let producer = Producer::<Hello, _>::from_config(broker.clone(), &config.broker)?;
    producer
        .produce(&Hello {
            name: "World".to_string(),
        })
        .await?;

    let consumer = Consumer::<Hello, _>::from_config(
        broker,
        &config.broker,
        &config.consumer.clone().with_retry_cooldown(100),
    )?;

    let workers = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.consume().await }
    });

    // Give the workers a moment to drain the queue
    tokio::time::sleep(Duration::from_millis(500)).await;

    producer.close().await;
    consumer.close().await;
    workers.await.expect("worker pool panicked")?;

    println!("Producer metrics: {:?}", producer.metrics().await);
    println!("Consumer metrics: {:?}", consumer.metrics().await);
    Ok(())
}
