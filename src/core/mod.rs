//! Producer and consumer engines.
//!
//! Both engines are generic over the task type they carry and the broker
//! backend they talk to. Each keeps its clients in lazily opened slots and
//! its counters behind a lock of their own.

pub mod consumer;
pub mod metrics;
pub mod producer;
pub(crate) mod slot;

pub use consumer::{Consumer, DEFAULT_RETRY_COOLDOWN, WorkerState};
pub use metrics::{ConsumerMetrics, ProducerMetrics};
pub use producer::Producer;
