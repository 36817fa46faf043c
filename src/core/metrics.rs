//! Counters kept by the engines.
//!
//! Counters only ever grow for the lifetime of an engine. They sit behind a
//! lock of their own so bookkeeping never waits on client lifecycle work.

use serde::Serialize;
use tokio::sync::Mutex;

/// Snapshot of a [`Producer`](super::Producer)'s counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProducerMetrics {
    /// Clients opened successfully
    pub success_client_init_count: u64,
    /// Client opens that failed
    pub error_client_init_count: u64,
    /// Clients torn down
    pub close_client_count: u64,
    /// Tasks published
    pub success_produce_count: u64,
}

/// Snapshot of a [`Consumer`](super::Consumer)'s counters, summed over all workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerMetrics {
    /// Clients opened successfully
    pub success_client_init_count: u64,
    /// Client opens that failed
    pub error_client_init_count: u64,
    /// Clients torn down
    pub close_client_count: u64,
    /// Deliveries settled as processed (including undecodable ones)
    pub ack_count: u64,
    /// Deliveries rejected for redelivery
    pub nack_count: u64,
}

/// Lock-guarded counter bundle.
#[derive(Debug, Default)]
pub(crate) struct MetricsCell<M> {
    counters: Mutex<M>,
}

impl<M: Copy + Default> MetricsCell<M> {
    pub(crate) fn new() -> Self {
        Self {
            counters: Mutex::new(M::default()),
        }
    }

    /// Apply an update under the counter lock.
    pub(crate) async fn record(&self, update: impl FnOnce(&mut M)) {
        let mut counters = self.counters.lock().await;
        update(&mut counters);
    }

    /// Copy of the current counters.
    pub(crate) async fn snapshot(&self) -> M {
        *self.counters.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let cell = Arc::new(MetricsCell::<ConsumerMetrics>::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cell = Arc::clone(&cell);
                tokio::spawn(async move {
                    for _ in 0..100 {
                        cell.record(|m| m.ack_count += 1).await;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = cell.snapshot().await;
        assert_eq!(snapshot.ack_count, 1600);
        assert_eq!(snapshot.nack_count, 0);
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let cell = MetricsCell::<ProducerMetrics>::new();
        let before = cell.snapshot().await;
        cell.record(|m| m.success_produce_count += 1).await;

        assert_eq!(before, ProducerMetrics::default());
        assert_eq!(cell.snapshot().await.success_produce_count, 1);
    }
}
