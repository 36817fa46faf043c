//! Producer engine.
//!
//! A producer owns a single client slot. The client is opened on first use,
//! shared by concurrent `produce` calls and thrown away after a failed
//! publish so the next call starts from a fresh connection.

use super::metrics::{MetricsCell, ProducerMetrics};
use super::slot::{ClientSlot, SlotInit};
use crate::broker::{BrokerClient, BrokerConnector, ClientRole};
use crate::config::BrokerConfig;
use crate::error::{RelayError, RelayResult};
use crate::task::RelayTask;
use std::marker::PhantomData;

/// Publishes tasks of type `T` to their queue.
///
/// # Examples
///
/// ```rust
/// # use relayq::prelude::*;
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Debug, Serialize, Deserialize)]
/// # struct EmailTask { to: String }
/// # #[async_trait::async_trait]
/// # impl RelayTask for EmailTask {
/// #     async fn run(self) -> RelayResult<()> { Ok(()) }
/// # }
/// # async fn example() -> RelayResult<()> {
/// let producer = Producer::<EmailTask, _>::new(InMemoryBroker::new(), "memory://local")?;
///
/// producer.produce(&EmailTask { to: "user@example.com".to_string() }).await?;
/// producer.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Producer<T, B: BrokerConnector> {
    connector: B,
    url: String,
    queue: String,
    slot: ClientSlot<B::Client>,
    metrics: MetricsCell<ProducerMetrics>,
    _task: PhantomData<fn(T)>,
}

impl<T: RelayTask, B: BrokerConnector> Producer<T, B> {
    /// Create a producer for `url`.
    ///
    /// Only the arguments are validated; the broker is not contacted until
    /// the first [`produce`](Self::produce), since it may become reachable later.
    pub fn new(connector: B, url: impl Into<String>) -> RelayResult<Self> {
        let url = url.into();
        if url.is_empty() {
            return Err(RelayError::config("URL must be set"));
        }

        Ok(Self {
            connector,
            url,
            queue: T::queue_name(),
            slot: ClientSlot::absent(),
            metrics: MetricsCell::new(),
            _task: PhantomData,
        })
    }

    /// Create a producer from broker configuration.
    pub fn from_config(connector: B, config: &BrokerConfig) -> RelayResult<Self> {
        config.ensure_url()?;
        Self::new(connector, config.url.clone())
    }

    /// Serialize `task` and publish it.
    ///
    /// Errors are returned for this call only; the caller decides whether to
    /// retry. A failed publish closes the client so the next call reopens it.
    pub async fn produce(&self, task: &T) -> RelayResult<()> {
        self.init_client().await?;

        let body = serde_json::to_vec(task)?;

        let published = {
            let client = self.slot.read().await;
            match client.as_ref() {
                Some(client) => client.publish(body).await,
                None => Err(RelayError::ClientUnavailable),
            }
        };

        if let Err(e) = published {
            tracing::warn!("Publish to {} failed, resetting client: {}", self.queue, e);
            self.close_client().await;
            return Err(e);
        }

        self.metrics.record(|m| m.success_produce_count += 1).await;
        tracing::debug!("Produced task to {}", self.queue);
        Ok(())
    }

    /// Close the client if one is open. Safe to call repeatedly.
    pub async fn close(&self) {
        self.close_client().await;
    }

    /// Snapshot of this producer's counters.
    pub async fn metrics(&self) -> ProducerMetrics {
        self.metrics.snapshot().await
    }

    /// Queue this producer publishes to.
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Whether a client is currently open.
    pub async fn is_connected(&self) -> bool {
        self.slot.is_present().await
    }

    async fn init_client(&self) -> RelayResult<()> {
        let opened = self
            .slot
            .get_or_open(move || self.connector.open(&self.url, &self.queue, ClientRole::Producer))
            .await;

        match opened {
            Ok(SlotInit::Ready) => Ok(()),
            Ok(SlotInit::Opened) => {
                self.metrics.record(|m| m.success_client_init_count += 1).await;
                tracing::debug!("Producer client opened for {}", self.queue);
                Ok(())
            }
            Err(e) => {
                self.metrics.record(|m| m.error_client_init_count += 1).await;
                Err(e)
            }
        }
    }

    async fn close_client(&self) {
        if self.slot.close().await {
            self.metrics.record(|m| m.close_client_count += 1).await;
            tracing::debug!("Producer client closed for {}", self.queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::testing::{Greeting, URL};
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn producer(broker: &InMemoryBroker) -> Producer<Greeting, InMemoryBroker> {
        Producer::new(broker.clone(), URL).unwrap()
    }

    #[test]
    fn test_empty_url_is_rejected() {
        let result = Producer::<Greeting, _>::new(InMemoryBroker::new(), "");
        assert!(matches!(result, Err(RelayError::ConfigError { .. })));

        let result = Producer::<Greeting, _>::from_config(InMemoryBroker::new(), &BrokerConfig::new(""));
        assert!(matches!(result, Err(RelayError::ConfigError { .. })));
    }

    #[tokio::test]
    async fn test_construction_does_not_connect() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker);

        assert!(!producer.is_connected().await);
        assert_eq!(broker.stats().await.opened, 0);
        assert_eq!(producer.queue_name(), Greeting::queue_name());
    }

    #[tokio::test]
    async fn test_produce_publishes_json() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker);

        producer.produce(&Greeting::new("probe", "World")).await.unwrap();
        producer.produce(&Greeting::new("probe", "Again")).await.unwrap();

        assert_eq!(broker.queue_depth(&Greeting::queue_name()).await, 2);
        let metrics = producer.metrics().await;
        assert_eq!(metrics.success_client_init_count, 1);
        assert_eq!(metrics.success_produce_count, 2);
        assert_eq!(metrics.close_client_count, 0);
    }

    #[tokio::test]
    async fn test_init_failure_is_counted_and_returned() {
        let broker = InMemoryBroker::new();
        broker.fail_next_opens(1).await;
        let producer = producer(&broker);

        let err = producer.produce(&Greeting::new("probe", "World")).await.unwrap_err();
        assert!(matches!(err, RelayError::ConnectionError { .. }));
        assert!(!producer.is_connected().await);

        producer.produce(&Greeting::new("probe", "World")).await.unwrap();

        let metrics = producer.metrics().await;
        assert_eq!(metrics.error_client_init_count, 1);
        assert_eq!(metrics.success_client_init_count, 1);
        assert_eq!(metrics.success_produce_count, 1);
    }

    #[tokio::test]
    async fn test_publish_failure_resets_client() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker);

        broker.set_publish_failure(true).await;
        let err = producer.produce(&Greeting::new("probe", "World")).await.unwrap_err();
        assert!(matches!(err, RelayError::TransportError { .. }));
        assert!(!producer.is_connected().await);

        broker.set_publish_failure(false).await;
        producer.produce(&Greeting::new("probe", "World")).await.unwrap();

        let metrics = producer.metrics().await;
        assert_eq!(metrics.success_client_init_count, 2);
        assert_eq!(metrics.close_client_count, 1);
        assert_eq!(metrics.success_produce_count, 1);
    }

    #[tokio::test]
    async fn test_severed_client_is_replaced() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker);

        producer.produce(&Greeting::new("probe", "before")).await.unwrap();
        broker.sever_all().await;

        assert!(producer.produce(&Greeting::new("probe", "lost")).await.is_err());
        producer.produce(&Greeting::new("probe", "after")).await.unwrap();

        assert_eq!(broker.queue_depth(&Greeting::queue_name()).await, 2);
        assert_eq!(producer.metrics().await.success_client_init_count, 2);
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Unencodable {
        by_bytes: HashMap<Vec<u8>, u8>,
    }

    #[async_trait::async_trait]
    impl RelayTask for Unencodable {
        async fn run(self) -> RelayResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_serialization_failure_does_not_publish() {
        let broker = InMemoryBroker::new();
        let producer = Producer::<Unencodable, _>::new(broker.clone(), URL).unwrap();

        let task = Unencodable {
            by_bytes: HashMap::from([(vec![1, 2], 3)]),
        };
        let err = producer.produce(&task).await.unwrap_err();

        assert!(matches!(err, RelayError::PayloadError(_)));
        assert!(producer.is_connected().await);
        assert_eq!(broker.queue_depth(&Unencodable::queue_name()).await, 0);
        assert_eq!(producer.metrics().await.close_client_count, 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker);

        producer.produce(&Greeting::new("probe", "World")).await.unwrap();
        producer.close().await;
        producer.close().await;

        assert_eq!(producer.metrics().await.close_client_count, 1);
        assert_eq!(broker.stats().await.closed, 1);
    }

    #[tokio::test]
    async fn test_close_without_client_is_a_noop() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker);

        producer.close().await;

        assert_eq!(producer.metrics().await, ProducerMetrics::default());
        assert_eq!(broker.stats().await.closed, 0);
    }

    #[tokio::test]
    async fn test_concurrent_produce_shares_one_client() {
        let broker = InMemoryBroker::new();
        let producer = Arc::new(producer(&broker));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let producer = Arc::clone(&producer);
                tokio::spawn(async move {
                    producer
                        .produce(&Greeting::new("probe", &format!("worker-{}", i)))
                        .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let metrics = producer.metrics().await;
        assert_eq!(metrics.success_client_init_count, 1);
        assert_eq!(metrics.success_produce_count, 8);
        assert_eq!(broker.queue_depth(&Greeting::queue_name()).await, 8);
    }
}
