//! Lazily opened, exclusively owned broker client.

use crate::broker::BrokerClient;
use crate::error::RelayResult;
use std::future::Future;
use tokio::sync::{RwLock, RwLockReadGuard};

/// Outcome of [`ClientSlot::get_or_open`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotInit {
    /// A client was already present
    Ready,
    /// A new client was opened and stored
    Opened,
}

/// One client handle, `absent` until opened and again after it is closed.
///
/// Opening and closing hold the write lock, so at most one of them is in
/// flight per slot. Using the client only needs the read lock.
#[derive(Debug)]
pub(crate) struct ClientSlot<C> {
    client: RwLock<Option<C>>,
}

impl<C: BrokerClient> ClientSlot<C> {
    pub(crate) fn absent() -> Self {
        Self {
            client: RwLock::new(None),
        }
    }

    pub(crate) async fn is_present(&self) -> bool {
        self.client.read().await.is_some()
    }

    /// Open a client with `open` unless one is already present.
    ///
    /// `open` runs under the write lock; on error the slot stays absent.
    pub(crate) async fn get_or_open<F, Fut>(&self, open: F) -> RelayResult<SlotInit>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RelayResult<C>>,
    {
        let mut client = self.client.write().await;
        if client.is_some() {
            return Ok(SlotInit::Ready);
        }

        *client = Some(open().await?);
        Ok(SlotInit::Opened)
    }

    /// Take the client out and close it. Returns `false` if the slot was absent.
    pub(crate) async fn close(&self) -> bool {
        let mut client = self.client.write().await;
        match client.take() {
            Some(open) => {
                open.close().await;
                true
            }
            None => false,
        }
    }

    /// Shared access to the current client, if any.
    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, Option<C>> {
        self.client.read().await
    }
}
