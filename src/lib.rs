//! # relayq
//!
//! Strongly-typed producers and worker-pool consumers over a durable message queue.
//!
//! ## Features
//!
//! - **Typed Tasks**: each task type owns its queue and its business logic
//! - **Lazy Connections**: clients open on first use and reopen after failures
//! - **Parallel Consumption**: a fixed pool of workers, one broker client each
//! - **At-least-once Processing**: failed tasks are nacked back onto the queue
//! - **Metrics**: per-engine counters for connections, publishes and acks
//!
//! ## Quick Start
//!
//! ```rust
//! use relayq::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct EmailTask {
//!     to: String,
//!     subject: String,
//! }
//!
//! #[async_trait]
//! impl RelayTask for EmailTask {
//!     async fn run(self) -> RelayResult<()> {
//!         println!("Sending '{}' to {}", self.subject, self.to);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> RelayResult<()> {
//!     let broker = InMemoryBroker::new();
//!
//!     let producer = Producer::<EmailTask, _>::new(broker.clone(), "memory://local")?;
//!     producer
//!         .produce(&EmailTask {
//!             to: "user@example.com".to_string(),
//!             subject: "Welcome".to_string(),
//!         })
//!         .await?;
//!     producer.close().await;
//!
//!     let consumer = Consumer::<EmailTask, _>::new(broker, "memory://local", 2)?;
//!     let workers = tokio::spawn({
//!         let consumer = consumer.clone();
//!         async move { consumer.consume().await }
//!     });
//!
//!     // ... later, on shutdown
//!     consumer.close().await;
//!     workers.await.ok();
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod task;
pub mod utils;

#[cfg(test)]
mod testing;

pub mod prelude {
    pub use crate::broker::{
        BrokerClient, BrokerConnector, ClientRole, Delivery, DeliveryStream, InMemoryBroker,
    };
    pub use crate::config::*;
    pub use crate::core::{Consumer, ConsumerMetrics, Producer, ProducerMetrics, WorkerState};
    pub use crate::error::{RelayError, RelayResult};
    pub use crate::logging::init_logging;
    pub use crate::task::RelayTask;
    pub use async_trait::async_trait;

    #[cfg(feature = "amqp")]
    #[cfg_attr(docsrs, doc(cfg(feature = "amqp")))]
    pub use crate::broker::AmqpConnector;
}

pub use crate::config::RelayConfig;
pub use crate::core::{Consumer, ConsumerMetrics, Producer, ProducerMetrics, WorkerState};
pub use crate::error::{RelayError, RelayResult};
pub use crate::task::RelayTask;
pub use async_trait::async_trait;
