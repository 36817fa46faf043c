//! Small helpers shared by the engines.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Run `attempt` until it reports that no retry is wanted.
///
/// `attempt` returns `true` to be called again after `cooldown`, `false` to
/// stop. The loop owns no state of its own, so every worker drives an
/// independent instance.
pub async fn retry_with_cooldown<F, Fut>(cooldown: Duration, mut attempt: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    while attempt().await {
        sleep(cooldown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_between_attempts() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let started = Instant::now();

        retry_with_cooldown(Duration::from_secs(5), move || async move {
            attempts.fetch_add(1, Ordering::SeqCst) < 2
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_without_sleeping() {
        let started = Instant::now();
        let mut calls = 0;

        retry_with_cooldown(Duration::from_secs(5), || {
            calls += 1;
            async { false }
        })
        .await;

        assert_eq!(calls, 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
