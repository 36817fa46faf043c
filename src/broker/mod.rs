//! Broker backends for relayq.
//!
//! The engines never speak a wire protocol themselves. They open clients
//! through a [`BrokerConnector`] and drive them through [`BrokerClient`]:
//! - **In-Memory**: process-local durable queues, used for development and tests
//! - **AMQP**: RabbitMQ through `lapin` (requires the `amqp` feature)
//!
//! # Examples
//!
//! ```rust,no_run
//! use relayq::prelude::*;
//!
//! // In-memory broker (default)
//! let broker = InMemoryBroker::new();
//!
//! // RabbitMQ (requires amqp feature)
//! # #[cfg(feature = "amqp")]
//! let broker = AmqpConnector::new("relayq");
//! ```

use crate::error::RelayResult;
use async_trait::async_trait;
use futures::stream::BoxStream;

pub mod memory;
pub use memory::InMemoryBroker;

#[cfg(feature = "amqp")]
#[cfg_attr(docsrs, doc(cfg(feature = "amqp")))]
pub mod amqp;

#[cfg(feature = "amqp")]
#[cfg_attr(docsrs, doc(cfg(feature = "amqp")))]
pub use amqp::AmqpConnector;

/// Number of unacknowledged deliveries a consumer-role client may hold.
pub const CONSUMER_PREFETCH: u16 = 1;

/// What a client is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    /// Publishes messages
    Producer,
    /// Receives messages, at most [`CONSUMER_PREFETCH`] unacknowledged at a time
    Consumer,
}

/// Stream of deliveries returned by [`BrokerClient::consume`].
///
/// The stream ends when the client is closed or the broker severs the
/// channel. An `Err` item reports a channel failure; no further deliveries
/// follow it.
pub type DeliveryStream = BoxStream<'static, RelayResult<Delivery>>;

/// Opens clients bound to a named durable queue.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    /// Client type produced by this connector
    type Client: BrokerClient;

    /// Connect to `url` and declare the durable queue `queue`.
    async fn open(&self, url: &str, queue: &str, role: ClientRole) -> RelayResult<Self::Client>;
}

/// An open connection and channel bound to one queue.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Persist one message on the bound queue.
    async fn publish(&self, body: Vec<u8>) -> RelayResult<()>;

    /// Start receiving deliveries from the bound queue.
    async fn consume(&self) -> RelayResult<DeliveryStream>;

    /// Release the channel and connection.
    async fn close(self);
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Remove the delivery from the queue.
    async fn ack(&self) -> RelayResult<()>;

    /// Reject the delivery and put it back on the queue.
    async fn nack_requeue(&self) -> RelayResult<()>;
}

/// A message received from the broker.
pub struct Delivery {
    body: Vec<u8>,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Build a delivery from its body and the handle that settles it.
    pub fn new(body: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            body,
            redelivered,
            acker,
        }
    }

    /// Raw message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the broker delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Acknowledge the delivery.
    pub async fn ack(self) -> RelayResult<()> {
        self.acker.ack().await
    }

    /// Negatively acknowledge the delivery, asking for redelivery.
    pub async fn nack_requeue(self) -> RelayResult<()> {
        self.acker.nack_requeue().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}
