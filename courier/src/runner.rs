use crate::hub::Route;
use crate::transport::inbound::Handler;
use crate::util::backoff::Backoff;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The handle of a spawned subscriber task, as returned by
/// [`Route::spawn_subscriber`](crate::Route::spawn_subscriber).
///
/// The task itself does no message work; it re-establishes the subscription
/// whenever it ends, for as long as the cancellation token stays unsignaled.
pub struct SubscriberHandle {
    name: Arc<str>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SubscriberHandle {
    /// Reports the name of the spawned subscriber task.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals the cancellation token the task runs under. In-flight dispatch
    /// is allowed to finish; subsequent deliveries are not dispatched.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the task to finish. Usually preceded by
    /// [`cancel`](SubscriberHandle::cancel).
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

/// Spawns the long-lived subscriber task for the given route.
pub(crate) fn spawn<T, H>(
    route: Route,
    handler: H,
    cancel: CancellationToken,
) -> SubscriberHandle
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    H: Handler<T> + 'static,
{
    let name = compose_name(route.endpoint().name());

    let task_name = Arc::clone(&name);
    let task_cancel = cancel.clone();

    let handle = tokio::spawn(async move {
        let backoff = Backoff::default();

        while !task_cancel.is_cancelled() {
            match route.subscribe::<T, H>(&handler, task_cancel.clone()).await {
                // The subscription ended (cancellation, or the consumer dried
                // out); re-establish on the next iteration
                Ok(()) => backoff.reset(),

                // The subscription could not be established
                Err(error) => {
                    warn!(
                        alert = true,
                        runner = task_name.as_ref(),
                        ?error,
                        error_message = %error,
                        "Failed to subscribe; backing off before retrying",
                    );

                    backoff.sleep_next().await;
                }
            }
        }

        info!(runner = task_name.as_ref(), "Subscriber task stopped");
    });

    SubscriberHandle {
        name,
        cancel,
        handle,
    }
}

/// Composes a globally unique, human-readable name for a subscriber task.
fn compose_name(endpoint: &str) -> Arc<str> {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    Arc::from(format!(
        "courier:runner:{}:{}",
        endpoint,
        COUNTER.fetch_add(1, Ordering::Relaxed),
    ))
}
