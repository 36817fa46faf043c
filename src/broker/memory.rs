//! In-memory broker implementation for relayq.
//!
//! This backend keeps every queue in process memory. It mirrors the parts of
//! AMQP semantics the engines rely on, which makes it the test double for the
//! whole crate and a convenient backend for development.
//!
//! # Features
//!
//! - **Durable queues**: messages outlive the clients that published them
//! - **Prefetch**: consumer-role clients hold at most one unacknowledged delivery
//! - **Redelivery**: nacked deliveries and deliveries left unsettled by a
//!   closing client go back to the head of the queue, marked redelivered
//! - **Fault injection**: unreachable broker, refused opens, rejected publishes
//!   and severed channels, for exercising the engines' recovery paths

use super::{
    Acknowledger, BrokerClient, BrokerConnector, CONSUMER_PREFETCH, ClientRole, Delivery,
    DeliveryStream,
};
use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, watch};

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

impl Message {
    fn redelivery(mut self) -> Self {
        self.redelivered = true;
        self
    }
}

type Unacked = Arc<Mutex<HashMap<u64, Message>>>;

/// A single named queue
#[derive(Debug, Default)]
struct QueueState {
    ready: Mutex<VecDeque<Message>>,
    available: Notify,
}

impl QueueState {
    async fn push_back(&self, message: Message) {
        self.ready.lock().await.push_back(message);
        self.available.notify_one();
    }

    async fn push_front(&self, message: Message) {
        self.ready.lock().await.push_front(message);
        self.available.notify_one();
    }

    async fn pop(&self) -> Option<Message> {
        self.ready.lock().await.pop_front()
    }

    async fn len(&self) -> usize {
        self.ready.lock().await.len()
    }
}

/// Bookkeeping for an open client
#[derive(Debug)]
struct Registration {
    closed_tx: watch::Sender<bool>,
    unacked: Unacked,
    queue: Arc<QueueState>,
}

#[derive(Debug, Default)]
struct Faults {
    unreachable: bool,
    failing_opens: u32,
    failing_publishes: bool,
}

/// Counters describing client traffic against an [`InMemoryBroker`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Clients successfully opened
    pub opened: u64,
    /// `close` calls received from clients
    pub closed: u64,
    /// Clients cut off by [`InMemoryBroker::sever_all`]
    pub severed: u64,
    /// Clients currently connected
    pub open_clients: usize,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
    clients: Mutex<HashMap<u64, Registration>>,
    faults: Mutex<Faults>,
    stats: Mutex<BrokerStats>,
    next_client_id: AtomicU64,
    next_tag: Arc<AtomicU64>,
}

/// In-memory broker backend.
///
/// Cloning is cheap; clones share the same queues.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `open` fail (or succeed again).
    pub async fn set_reachable(&self, reachable: bool) {
        self.state.faults.lock().await.unreachable = !reachable;
    }

    /// Refuse the next `count` opens.
    pub async fn fail_next_opens(&self, count: u32) {
        self.state.faults.lock().await.failing_opens = count;
    }

    /// Reject every publish while enabled.
    pub async fn set_publish_failure(&self, failing: bool) {
        self.state.faults.lock().await.failing_publishes = failing;
    }

    /// Cut off every open client, as a broker restart would.
    ///
    /// Delivery streams end and unsettled deliveries are requeued. Returns
    /// the number of clients severed.
    pub async fn sever_all(&self) -> usize {
        let ids: Vec<u64> = self.state.clients.lock().await.keys().copied().collect();
        let mut severed = 0;
        for id in ids {
            if self.release(id).await {
                severed += 1;
            }
        }

        self.state.stats.lock().await.severed += severed as u64;
        tracing::debug!("Severed {} in-memory clients", severed);
        severed
    }

    /// Put raw bytes on `queue`, bypassing any client.
    pub async fn publish_raw(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let queue = self.declare(queue).await;
        queue
            .push_back(Message {
                body: body.into(),
                redelivered: false,
            })
            .await;
    }

    /// Number of messages ready for delivery on `queue`.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        let existing = self.state.queues.lock().await.get(queue).cloned();
        match existing {
            Some(queue) => queue.len().await,
            None => 0,
        }
    }

    /// Snapshot of client counters.
    pub async fn stats(&self) -> BrokerStats {
        let open_clients = self.state.clients.lock().await.len();
        let mut stats = *self.state.stats.lock().await;
        stats.open_clients = open_clients;
        stats
    }

    async fn declare(&self, name: &str) -> Arc<QueueState> {
        let mut queues = self.state.queues.lock().await;
        Arc::clone(queues.entry(name.to_string()).or_default())
    }

    /// Close a client's channel and requeue whatever it left unsettled.
    async fn release(&self, id: u64) -> bool {
        let registration = self.state.clients.lock().await.remove(&id);
        let Some(registration) = registration else {
            return false;
        };

        // Signal first so a stream racing with the drain below requeues its own delivery.
        let _ = registration.closed_tx.send(true);

        let mut pending: Vec<(u64, Message)> =
            registration.unacked.lock().await.drain().collect();
        pending.sort_by_key(|(tag, _)| *tag);

        for (_, message) in pending.into_iter().rev() {
            registration.queue.push_front(message.redelivery()).await;
        }

        true
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    type Client = InMemoryClient;

    async fn open(&self, url: &str, queue: &str, role: ClientRole) -> RelayResult<InMemoryClient> {
        {
            let mut faults = self.state.faults.lock().await;
            if faults.unreachable {
                return Err(RelayError::unreachable(format!(
                    "broker at {} is unreachable",
                    url
                )));
            }
            if faults.failing_opens > 0 {
                faults.failing_opens -= 1;
                return Err(RelayError::unreachable(format!(
                    "connection to {} refused",
                    url
                )));
            }
        }

        let queue_state = self.declare(queue).await;
        let id = self.state.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (closed_tx, closed_rx) = watch::channel(false);
        let unacked: Unacked = Arc::default();

        self.state.clients.lock().await.insert(
            id,
            Registration {
                closed_tx,
                unacked: Arc::clone(&unacked),
                queue: Arc::clone(&queue_state),
            },
        );
        self.state.stats.lock().await.opened += 1;

        tracing::debug!("Opened in-memory client {} ({:?}) on queue {}", id, role, queue);

        Ok(InMemoryClient {
            id,
            queue_name: queue.to_string(),
            queue: queue_state,
            role,
            closed_rx,
            unacked,
            broker: self.clone(),
        })
    }
}

/// Client handle returned by [`InMemoryBroker`]
#[derive(Debug)]
pub struct InMemoryClient {
    id: u64,
    queue_name: String,
    queue: Arc<QueueState>,
    role: ClientRole,
    closed_rx: watch::Receiver<bool>,
    unacked: Unacked,
    broker: InMemoryBroker,
}

impl InMemoryClient {
    /// Name of the bound queue
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn ensure_open(&self) -> RelayResult<()> {
        if *self.closed_rx.borrow() {
            return Err(RelayError::channel(format!(
                "channel {} on queue {} is closed",
                self.id, self.queue_name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for InMemoryClient {
    async fn publish(&self, body: Vec<u8>) -> RelayResult<()> {
        self.ensure_open()?;

        if self.broker.state.faults.lock().await.failing_publishes {
            return Err(RelayError::channel(format!(
                "publish to {} rejected",
                self.queue_name
            )));
        }

        self.queue
            .push_back(Message {
                body,
                redelivered: false,
            })
            .await;
        Ok(())
    }

    async fn consume(&self) -> RelayResult<DeliveryStream> {
        self.ensure_open()?;

        let prefetch = match self.role {
            ClientRole::Consumer => Some(Arc::new(Semaphore::new(CONSUMER_PREFETCH as usize))),
            ClientRole::Producer => None,
        };

        let cursor = DeliveryCursor {
            queue: Arc::clone(&self.queue),
            closed_rx: self.closed_rx.clone(),
            prefetch,
            unacked: Arc::clone(&self.unacked),
            tags: Arc::clone(&self.broker.state.next_tag),
        };

        let deliveries = stream::unfold(cursor, |mut cursor| async move {
            let delivery = cursor.next_delivery().await?;
            Some((Ok(delivery), cursor))
        });

        Ok(deliveries.boxed())
    }

    async fn close(self) {
        self.broker.release(self.id).await;
        self.broker.state.stats.lock().await.closed += 1;
        tracing::debug!("Closed in-memory client {}", self.id);
    }
}

/// State behind a single delivery stream
struct DeliveryCursor {
    queue: Arc<QueueState>,
    closed_rx: watch::Receiver<bool>,
    prefetch: Option<Arc<Semaphore>>,
    unacked: Unacked,
    tags: Arc<AtomicU64>,
}

impl DeliveryCursor {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        let permit = match &self.prefetch {
            Some(prefetch) => {
                let prefetch = Arc::clone(prefetch);
                tokio::select! {
                    permit = prefetch.acquire_owned() => Some(permit.ok()?),
                    _ = wait_closed(&mut self.closed_rx) => return None,
                }
            }
            None => None,
        };

        loop {
            if *self.closed_rx.borrow() {
                return None;
            }

            if let Some(message) = self.queue.pop().await {
                let tag = self.tags.fetch_add(1, Ordering::Relaxed);
                self.unacked.lock().await.insert(tag, message.clone());

                if *self.closed_rx.borrow() {
                    // The client closed between pop and insert; hand the message back.
                    if let Some(message) = self.unacked.lock().await.remove(&tag) {
                        self.queue.push_front(message.redelivery()).await;
                    }
                    return None;
                }

                let acker = MemoryAcker {
                    tag,
                    queue: Arc::clone(&self.queue),
                    unacked: Arc::clone(&self.unacked),
                    permit: Mutex::new(permit),
                };
                return Some(Delivery::new(
                    message.body,
                    message.redelivered,
                    Box::new(acker),
                ));
            }

            tokio::select! {
                _ = self.queue.available.notified() => {}
                _ = wait_closed(&mut self.closed_rx) => return None,
            }
        }
    }
}

async fn wait_closed(closed_rx: &mut watch::Receiver<bool>) {
    loop {
        let closed = *closed_rx.borrow_and_update();
        if closed || closed_rx.changed().await.is_err() {
            return;
        }
    }
}

struct MemoryAcker {
    tag: u64,
    queue: Arc<QueueState>,
    unacked: Unacked,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl MemoryAcker {
    async fn settle(&self) -> RelayResult<Message> {
        self.permit.lock().await.take();
        self.unacked.lock().await.remove(&self.tag).ok_or_else(|| {
            RelayError::channel(format!(
                "delivery {} is no longer outstanding (channel closed)",
                self.tag
            ))
        })
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> RelayResult<()> {
        self.settle().await?;
        Ok(())
    }

    async fn nack_requeue(&self) -> RelayResult<()> {
        let message = self.settle().await?;
        self.queue.push_front(message.redelivery()).await;
        Ok(())
    }
}
