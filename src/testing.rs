//! Test support: a probe-reporting task and polling helpers.

use crate::error::{RelayError, RelayResult};
use crate::task::RelayTask;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) const URL: &str = "memory://local";

static PROBES: LazyLock<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Register a fresh probe; every [`Greeting`] run against it reports its name.
pub(crate) fn probe() -> (String, mpsc::UnboundedReceiver<String>) {
    let id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    PROBES.lock().unwrap().insert(id.clone(), tx);
    (id, rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Outcome {
    Succeed,
    Fail,
    Panic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Greeting {
    pub probe: String,
    pub name: String,
    pub outcome: Outcome,
}

impl Greeting {
    pub(crate) fn new(probe: &str, name: &str) -> Self {
        Self {
            probe: probe.to_string(),
            name: name.to_string(),
            outcome: Outcome::Succeed,
        }
    }

    pub(crate) fn failing(probe: &str, name: &str) -> Self {
        Self {
            outcome: Outcome::Fail,
            ..Self::new(probe, name)
        }
    }

    pub(crate) fn panicking(probe: &str, name: &str) -> Self {
        Self {
            outcome: Outcome::Panic,
            ..Self::new(probe, name)
        }
    }
}

#[async_trait]
impl RelayTask for Greeting {
    async fn run(self) -> RelayResult<()> {
        let sender = PROBES.lock().unwrap().get(&self.probe).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(self.name.clone());
        }

        match self.outcome {
            Outcome::Succeed => Ok(()),
            Outcome::Fail => Err(RelayError::task_failed(format!("refusing to greet {}", self.name))),
            Outcome::Panic => panic!("greeting {} blew up", self.name),
        }
    }
}

/// Poll `check` until it holds, panicking after five seconds.
pub(crate) async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    assert!(polled.is_ok(), "condition not met within 5s");
}
