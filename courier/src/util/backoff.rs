use backoff::backoff::Backoff as InnerBackoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use parking_lot::Mutex as SyncMutex;
use std::time::Duration;

/// Thin wrapper around [`ExponentialBackoff`] that adds light-weight
/// synchronization for interior mutability and opinionated defaults suitable
/// for broker reconnection (3 s initial interval, 60 s cap, multiplier 2,
/// no elapsed-time limit).
pub(crate) struct Backoff {
    inner: SyncMutex<ExponentialBackoff>,
}

impl Backoff {
    /// Returns the next backoff interval, if the strategy has one.
    pub(crate) fn next(&self) -> Option<Duration> {
        self.inner.lock().next_backoff()
    }

    /// Sleeps for the next backoff interval.
    pub(crate) async fn sleep_next(&self) {
        match self.next() {
            Some(duration) => tokio::time::sleep(duration).await,
            None => tokio::task::yield_now().await,
        }
    }

    /// Resets this backoff to the initial interval.
    pub(crate) fn reset(&self) {
        self.inner.lock().reset();
    }
}

impl Default for Backoff {
    fn default() -> Self {
        let inner = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(3))
            .with_max_interval(Duration::from_secs(60))
            .with_multiplier(2.0)
            .with_randomization_factor(0.5)
            .with_max_elapsed_time(None)
            .build();

        Self {
            inner: SyncMutex::new(inner),
        }
    }
}
