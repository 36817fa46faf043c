//! AMQP 0.9.1 broker implementation for relayq.
//!
//! This backend talks to RabbitMQ through the `lapin` crate. Every client
//! owns one connection and one channel, declares its queue as durable and
//! publishes through the default exchange.
//!
//! # Features
//!
//! - **Durable queues**: queues survive broker restarts
//! - **Persistent messages**: published with delivery mode 2
//! - **Prefetch control**: consumer channels allow one unacknowledged delivery
//! - **Manual acknowledgement**: deliveries are settled by the consumer engine

use super::{
    Acknowledger, BrokerClient, BrokerConnector, CONSUMER_PREFETCH, ClientRole, Delivery,
    DeliveryStream,
};
use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, warn};

const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Opens RabbitMQ clients.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    connection_name: String,
}

impl AmqpConnector {
    /// Create a connector that labels its connections with `connection_name`.
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
        }
    }

    /// Create a connector from broker configuration.
    pub fn from_config(config: &crate::config::BrokerConfig) -> Self {
        Self::new(config.connection_name.clone())
    }
}

impl Default for AmqpConnector {
    fn default() -> Self {
        Self::new("relayq")
    }
}

/// Strip credentials from an AMQP URL before it reaches a log line.
fn redact(url: &str) -> &str {
    match url.rfind('@') {
        Some(at) => &url[at + 1..],
        None => url,
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    type Client = AmqpClient;

    async fn open(&self, url: &str, queue: &str, role: ClientRole) -> RelayResult<AmqpClient> {
        let connection = Connection::connect(
            url,
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into()),
        )
        .await
        .map_err(|e| RelayError::connection(format!("Failed to connect to {}", redact(url)), e))?;

        match declare(&connection, queue, role).await {
            Ok(channel) => {
                debug!(
                    "Opened AMQP client ({:?}) on queue {} at {}",
                    role,
                    queue,
                    redact(url)
                );
                Ok(AmqpClient {
                    connection,
                    channel,
                    queue: queue.to_string(),
                })
            }
            Err(e) => {
                if let Err(close_err) = connection.close(REPLY_SUCCESS, "setup failed").await {
                    debug!("Failed to close half-open AMQP connection: {}", close_err);
                }
                Err(e)
            }
        }
    }
}

async fn declare(connection: &Connection, queue: &str, role: ClientRole) -> RelayResult<Channel> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| RelayError::connection("Failed to open AMQP channel", e))?;

    if role == ClientRole::Consumer {
        channel
            .basic_qos(CONSUMER_PREFETCH, BasicQosOptions::default())
            .await
            .map_err(|e| RelayError::connection("Failed to set prefetch", e))?;
    }

    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| RelayError::connection(format!("Failed to declare queue {}", queue), e))?;

    Ok(channel)
}

/// Connection and channel bound to one durable queue.
#[derive(Debug)]
pub struct AmqpClient {
    connection: Connection,
    channel: Channel,
    queue: String,
}

#[async_trait]
impl BrokerClient for AmqpClient {
    async fn publish(&self, body: Vec<u8>) -> RelayResult<()> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());

        self.channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|e| RelayError::transport(format!("Failed to publish to {}", self.queue), e))?
            .await
            .map_err(|e| RelayError::transport(format!("Publish to {} not confirmed", self.queue), e))?;

        Ok(())
    }

    async fn consume(&self) -> RelayResult<DeliveryStream> {
        let consumer_tag = format!("relayq-{}", uuid::Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RelayError::transport(format!("Failed to consume {}", self.queue), e))?;

        let deliveries = consumer.map(|item| {
            item.map(|delivery| {
                Delivery::new(
                    delivery.data,
                    delivery.redelivered,
                    Box::new(AmqpAcker {
                        acker: delivery.acker,
                    }),
                )
            })
            .map_err(|e| RelayError::transport("AMQP delivery stream failed", e))
        });

        Ok(deliveries.boxed())
    }

    async fn close(self) {
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "OK").await {
            warn!("Failed to close AMQP channel on {}: {}", self.queue, e);
        }
        if let Err(e) = self.connection.close(REPLY_SUCCESS, "OK").await {
            warn!("Failed to close AMQP connection for {}: {}", self.queue, e);
        }
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> RelayResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RelayError::transport("ack failed", e))
    }

    async fn nack_requeue(&self) -> RelayResult<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
            .map_err(|e| RelayError::transport("nack failed", e))
    }
}
