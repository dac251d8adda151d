//! Shutdown signal shared by the tasks of one plugin run.

use tokio::sync::watch;

/// Create a shutdown signal. Sending `true` more than once is harmless.
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolve once shutdown is signaled or the sender is gone.
///
/// Returns immediately if the flag is already set.
pub async fn signaled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
