//! Task definition and execution traits.

use crate::error::RelayResult;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Trait that every payload flowing through relayq must implement.
///
/// A task is serialized to JSON by the [`Producer`](crate::core::Producer),
/// travels through the queue named by [`queue_name`](RelayTask::queue_name)
/// and is rebuilt by a [`Consumer`](crate::core::Consumer) worker, which then
/// calls [`run`](RelayTask::run). Returning `Ok` acknowledges the delivery;
/// returning `Err` rejects it and asks the broker to redeliver.
#[async_trait]
pub trait RelayTask: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Execute the task.
    async fn run(self) -> RelayResult<()>;

    /// Name of the queue instances of this type flow through.
    ///
    /// By default this is the fully qualified type name (module path plus
    /// type name). Override it to share a queue across crates or to pin the
    /// name independently of where the type lives.
    fn queue_name() -> String
    where
        Self: Sized,
    {
        std::any::type_name::<Self>().to_string()
    }
}
