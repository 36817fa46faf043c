//! Consumer engine.
//!
//! A consumer runs a fixed pool of workers. Each worker owns one client slot
//! and loops through consume cycles until the consumer is closed:
//!
//! 1. `Initializing`: open the worker's client if it is absent
//! 2. `Streaming`: pull deliveries one at a time, run the task, ack or nack
//! 3. `Draining`: once the stream ends, close the client
//! 4. `Idle`: check the closed flag, then sleep the cooldown and start over
//!
//! Failed cycles are logged and retried; they never stop the worker. Shutdown
//! is cooperative: [`Consumer::close`] sets a flag and closes every client,
//! which ends the open streams. A worker stuck inside a task's `run` holds up
//! shutdown until that task returns.

use super::metrics::{ConsumerMetrics, MetricsCell};
use super::slot::{ClientSlot, SlotInit};
use crate::broker::{BrokerClient, BrokerConnector, ClientRole, Delivery, DeliveryStream};
use crate::config::{BrokerConfig, ConsumerConfig};
use crate::error::{RelayError, RelayResult};
use crate::task::RelayTask;
use crate::utils::retry_with_cooldown;
use futures::StreamExt;
use futures::future::join_all;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

/// Pause between consume cycles used by [`Consumer::new`].
pub const DEFAULT_RETRY_COOLDOWN: Duration = Duration::from_secs(5);

/// Where a worker currently is in its consume cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Between cycles (or not started)
    Idle,
    /// Opening its broker client
    Initializing,
    /// Receiving and processing deliveries
    Streaming,
    /// Stream ended; closing its broker client
    Draining,
    /// Observed the closed flag and exited
    Stopped,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Initializing,
            2 => WorkerState::Streaming,
            3 => WorkerState::Draining,
            4 => WorkerState::Stopped,
            _ => WorkerState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Idle => 0,
            WorkerState::Initializing => 1,
            WorkerState::Streaming => 2,
            WorkerState::Draining => 3,
            WorkerState::Stopped => 4,
        }
    }
}

/// How a delivery is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    NackRequeue,
}

/// Runs a pool of workers executing tasks of type `T` from their queue.
///
/// Cloning yields another handle to the same consumer, so one handle can
/// drive [`consume`](Self::consume) while another calls [`close`](Self::close).
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
/// let consumer = Consumer::<EmailTask, _>::new(InMemoryBroker::new(), "memory://local", 4)?;
///
/// let worker_pool = tokio::spawn({
///     let consumer = consumer.clone();
///     async move { consumer.consume().await }
/// });
///
/// // ... later
/// consumer.close().await;
/// worker_pool.await.ok();
/// # Ok(())
/// # }
/// ```
pub struct Consumer<T, B: BrokerConnector> {
    inner: Arc<ConsumerInner<T, B>>,
}

impl<T, B: BrokerConnector> Clone for Consumer<T, B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ConsumerInner<T, B: BrokerConnector> {
    connector: B,
    url: String,
    queue: String,
    cooldown: Duration,
    slots: Vec<ClientSlot<B::Client>>,
    states: Vec<AtomicU8>,
    closed: Mutex<bool>,
    consuming: AtomicBool,
    metrics: MetricsCell<ConsumerMetrics>,
    _task: PhantomData<fn() -> T>,
}

impl<T: RelayTask, B: BrokerConnector> Consumer<T, B> {
    /// Create a consumer with `parallelism` workers and the default cooldown.
    ///
    /// Only the arguments are validated; no worker connects before
    /// [`consume`](Self::consume) runs.
    pub fn new(connector: B, url: impl Into<String>, parallelism: usize) -> RelayResult<Self> {
        Self::build(connector, url.into(), parallelism, DEFAULT_RETRY_COOLDOWN)
    }

    /// Create a consumer from configuration.
    pub fn from_config(
        connector: B,
        broker: &BrokerConfig,
        config: &ConsumerConfig,
    ) -> RelayResult<Self> {
        broker.ensure_url()?;
        config.ensure_parallelism()?;
        Self::build(
            connector,
            broker.url.clone(),
            config.parallelism,
            config.retry_cooldown(),
        )
    }

    fn build(connector: B, url: String, parallelism: usize, cooldown: Duration) -> RelayResult<Self> {
        if url.is_empty() {
            return Err(RelayError::config("URL should be set"));
        }

        if parallelism < 1 {
            return Err(RelayError::config("parallelism should be at least 1"));
        }

        let inner = ConsumerInner {
            connector,
            url,
            queue: T::queue_name(),
            cooldown,
            slots: (0..parallelism).map(|_| ClientSlot::absent()).collect(),
            states: (0..parallelism)
                .map(|_| AtomicU8::new(WorkerState::Idle.as_u8()))
                .collect(),
            closed: Mutex::new(false),
            consuming: AtomicBool::new(false),
            metrics: MetricsCell::new(),
            _task: PhantomData,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Run every worker until the consumer is closed.
    ///
    /// Resolves once all workers have exited. May be called once per
    /// consumer; later calls fail with [`RelayError::AlreadyConsuming`].
    pub async fn consume(&self) -> RelayResult<()> {
        if self.inner.consuming.swap(true, Ordering::SeqCst) {
            return Err(RelayError::AlreadyConsuming);
        }

        let parallelism = self.inner.slots.len();
        info!(
            "Starting {} consumer workers on queue {}",
            parallelism, self.inner.queue
        );

        let handles: Vec<_> = (0..parallelism)
            .map(|index| {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { inner.consume_with_retry(index).await })
            })
            .collect();

        for (index, joined) in join_all(handles).await.into_iter().enumerate() {
            if let Err(e) = joined {
                error!("Consumer worker {} terminated abnormally: {}", index, e);
            }
        }

        info!("All consumer workers stopped on queue {}", self.inner.queue);
        Ok(())
    }

    /// Stop the consumer.
    ///
    /// Sets the closed flag and closes every open client. Only the first call
    /// has any effect. Workers exit after their current cycle ends.
    pub async fn close(&self) {
        {
            let mut closed = self.inner.closed.lock().await;
            if *closed {
                return;
            }
            *closed = true;
        }

        info!("Closing consumer on queue {}", self.inner.queue);
        for index in 0..self.inner.slots.len() {
            self.inner.close_client(index).await;
        }
    }

    /// Snapshot of the counters summed over all workers.
    pub async fn metrics(&self) -> ConsumerMetrics {
        self.inner.metrics.snapshot().await
    }

    /// Number of workers (and client slots).
    pub fn parallelism(&self) -> usize {
        self.inner.slots.len()
    }

    /// Number of workers currently holding an open client.
    pub async fn active_clients(&self) -> usize {
        let mut active = 0;
        for slot in &self.inner.slots {
            if slot.is_present().await {
                active += 1;
            }
        }
        active
    }

    /// Whether [`close`](Self::close) has been called.
    pub async fn is_closed(&self) -> bool {
        self.inner.is_closed().await
    }

    /// Queue this consumer reads from.
    pub fn queue_name(&self) -> &str {
        &self.inner.queue
    }

    /// Current state of every worker, indexed by worker.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.inner
            .states
            .iter()
            .map(|state| WorkerState::from_u8(state.load(Ordering::Acquire)))
            .collect()
    }
}

impl<T: RelayTask, B: BrokerConnector> ConsumerInner<T, B> {
    async fn is_closed(&self) -> bool {
        *self.closed.lock().await
    }

    fn set_state(&self, index: usize, state: WorkerState) {
        self.states[index].store(state.as_u8(), Ordering::Release);
        trace!("Worker {} on {} is {:?}", index, self.queue, state);
    }

    async fn consume_with_retry(&self, index: usize) {
        debug!("Worker {} started on queue {}", index, self.queue);

        retry_with_cooldown(self.cooldown, move || async move {
            match self.consume_cycle(index).await {
                Ok(()) => {}
                Err(RelayError::EngineClosed) => {}
                Err(e) if e.is_recoverable() => {
                    warn!("Worker {} consume cycle failed: {}", index, e);
                }
                Err(e) => {
                    error!("Worker {} consume cycle failed: {}", index, e);
                }
            }

            self.set_state(index, WorkerState::Idle);
            !self.is_closed().await
        })
        .await;

        self.set_state(index, WorkerState::Stopped);
        debug!("Worker {} stopped on queue {}", index, self.queue);
    }

    async fn consume_cycle(&self, index: usize) -> RelayResult<()> {
        self.set_state(index, WorkerState::Initializing);
        self.init_client(index).await?;

        self.set_state(index, WorkerState::Streaming);
        let streamed = self.stream_deliveries(index).await;

        self.set_state(index, WorkerState::Draining);
        self.close_client(index).await;

        streamed
    }

    async fn stream_deliveries(&self, index: usize) -> RelayResult<()> {
        let mut deliveries = self.start_consume(index).await?;

        while let Some(next) = deliveries.next().await {
            let delivery = next?;
            self.handle_delivery(index, delivery).await;
        }

        debug!("Delivery stream for worker {} ended", index);
        Ok(())
    }

    async fn start_consume(&self, index: usize) -> RelayResult<DeliveryStream> {
        let client = self.slots[index].read().await;
        match client.as_ref() {
            Some(client) => client.consume().await,
            None => Err(RelayError::ClientUnavailable),
        }
    }

    /// Run the task carried by `delivery` and settle it.
    ///
    /// Counters follow the logical outcome; a failed ack or nack is only logged.
    async fn handle_delivery(&self, index: usize, delivery: Delivery) {
        match self.execute(index, delivery.body()).await {
            Settlement::Ack => {
                self.metrics.record(|m| m.ack_count += 1).await;
                if let Err(e) = delivery.ack().await {
                    error!("Worker {} failed to ack delivery: {}", index, e);
                }
            }
            Settlement::NackRequeue => {
                self.metrics.record(|m| m.nack_count += 1).await;
                if let Err(e) = delivery.nack_requeue().await {
                    error!("Worker {} failed to nack delivery: {}", index, e);
                }
            }
        }
    }

    async fn execute(&self, index: usize, body: &[u8]) -> Settlement {
        let task: T = match serde_json::from_slice(body) {
            Ok(task) => task,
            Err(e) => {
                // Retrying cannot fix a malformed payload, so it is dropped.
                warn!(
                    "Worker {} dropping undecodable delivery on {}: {}",
                    index, self.queue, e
                );
                return Settlement::Ack;
            }
        };

        match tokio::spawn(task.run()).await {
            Ok(Ok(())) => Settlement::Ack,
            Ok(Err(e)) => {
                warn!("Worker {} task on {} failed: {}", index, self.queue, e);
                Settlement::NackRequeue
            }
            Err(join_error) => {
                error!(
                    "Worker {} task on {} panicked: {}",
                    index, self.queue, join_error
                );
                Settlement::NackRequeue
            }
        }
    }

    async fn init_client(&self, index: usize) -> RelayResult<()> {
        let opened = self.slots[index]
            .get_or_open(move || async move {
                if self.is_closed().await {
                    return Err(RelayError::EngineClosed);
                }
                self.connector
                    .open(&self.url, &self.queue, ClientRole::Consumer)
                    .await
            })
            .await;

        match opened {
            Ok(SlotInit::Ready) => Ok(()),
            Ok(SlotInit::Opened) => {
                self.metrics.record(|m| m.success_client_init_count += 1).await;
                debug!("Worker {} opened a client on {}", index, self.queue);
                Ok(())
            }
            Err(RelayError::EngineClosed) => Err(RelayError::EngineClosed),
            Err(e) => {
                self.metrics.record(|m| m.error_client_init_count += 1).await;
                Err(e)
            }
        }
    }

    async fn close_client(&self, index: usize) {
        if self.slots[index].close().await {
            self.metrics.record(|m| m.close_client_count += 1).await;
            debug!("Worker {} closed its client on {}", index, self.queue);
        }
    }
}
