//! Health propagation from fault watchers to open ListAndWatch streams.
//!
//! Watchers hold a [`HealthReporter`] and push virtual device ids. A single
//! propagation task drains the channel, marks the device unhealthy in the
//! [`DeviceTable`] and publishes one full device snapshot per event. Every
//! open stream re-sends that snapshot to the kubelet.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::device::{DeviceTable, VirtualDevice};
use crate::shutdown;

/// Capacity of the watcher → propagator channel.
pub const HEALTH_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the snapshot broadcast per subscriber.
pub const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

/// Handle used by fault watchers to degrade devices.
#[derive(Clone, Debug)]
pub struct HealthReporter {
    tx: mpsc::Sender<String>,
}

impl HealthReporter {
    /// Report a virtual device as unhealthy.
    ///
    /// Waits for channel capacity rather than dropping the event. Returns
    /// `false` once the plugin has gone away.
    pub async fn report_unhealthy(&self, device_id: impl Into<String>) -> bool {
        self.tx.send(device_id.into()).await.is_ok()
    }

    /// Blocking variant for watchers running on a blocking thread.
    ///
    /// Must not be called from within an async context.
    pub fn report_unhealthy_blocking(&self, device_id: impl Into<String>) -> bool {
        self.tx.blocking_send(device_id.into()).is_ok()
    }
}

/// Channel pair owned by the plugin for its whole lifetime.
///
/// The receiver is shared behind a mutex so a restarted plugin run can
/// resume draining the same channel its watchers write to.
pub struct HealthChannel {
    tx: mpsc::Sender<String>,
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
    snapshots: broadcast::Sender<Vec<VirtualDevice>>,
}

impl HealthChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(HEALTH_CHANNEL_CAPACITY);
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            snapshots,
        }
    }

    pub fn reporter(&self) -> HealthReporter {
        HealthReporter {
            tx: self.tx.clone(),
        }
    }

    /// Sender side of the snapshot broadcast, for stream handlers.
    pub fn snapshots(&self) -> broadcast::Sender<Vec<VirtualDevice>> {
        self.snapshots.clone()
    }

    /// Spawn the propagation task for one plugin run.
    pub fn spawn_propagator(
        &self,
        devices: Arc<DeviceTable>,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let rx = Arc::clone(&self.rx);
        let snapshots = self.snapshots.clone();
        tokio::spawn(async move {
            run_propagator(rx, devices, snapshots, shutdown).await;
        })
    }
}

impl Default for HealthChannel {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_propagator(
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
    devices: Arc<DeviceTable>,
    snapshots: broadcast::Sender<Vec<VirtualDevice>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut rx = rx.lock().await;
    debug!("Health propagator started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown::signaled(&mut shutdown) => {
                debug!("Health propagator shutting down");
                break;
            }

            event = rx.recv() => {
                let Some(device_id) = event else {
                    debug!("Health channel closed");
                    break;
                };

                match devices.mark_unhealthy(&device_id).await {
                    Some(changed) => {
                        info!(device_id = %device_id, changed, "Device marked unhealthy");
                        let snapshot = devices.snapshot().await;
                        // No receivers just means no stream is open yet.
                        let _ = snapshots.send(snapshot);
                    }
                    None => {
                        warn!(device_id = %device_id, "Health event for unknown device, ignoring");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;
    use std::time::Duration;

    use super::*;
    use crate::device::{derive_virtual, Health, PhysicalDevice};

    fn table() -> Arc<DeviceTable> {
        Arc::new(DeviceTable::new(derive_virtual(
            &[PhysicalDevice::new("gpu0"), PhysicalDevice::new("gpu1")],
            NonZeroU32::new(2).unwrap(),
        )))
    }

    #[tokio::test]
    async fn test_event_produces_full_snapshot() {
        let channel = HealthChannel::new();
        let devices = table();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut updates = channel.snapshots().subscribe();

        let handle = channel.spawn_propagator(Arc::clone(&devices), shutdown_rx);
        assert!(channel.reporter().report_unhealthy("gpu1-0").await);

        let snapshot = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.len(), 4);
        for device in &snapshot {
            let expected = if device.id == "gpu1-0" {
                Health::Unhealthy
            } else {
                Health::Healthy
            };
            assert_eq!(device.health, expected, "{}", device.id);
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_each_event_is_announced() {
        let channel = HealthChannel::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut updates = channel.snapshots().subscribe();
        let handle = channel.spawn_propagator(table(), shutdown_rx);

        let reporter = channel.reporter();
        reporter.report_unhealthy("gpu0-0").await;
        reporter.report_unhealthy("gpu0-0").await;

        for _ in 0..2 {
            let snapshot = tokio::time::timeout(Duration::from_secs(5), updates.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(snapshot[0].health, Health::Unhealthy);
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_device_is_ignored() {
        let channel = HealthChannel::new();
        let devices = table();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut updates = channel.snapshots().subscribe();
        let handle = channel.spawn_propagator(Arc::clone(&devices), shutdown_rx);

        channel.reporter().report_unhealthy("gpu7-0").await;
        channel.reporter().report_unhealthy("gpu0-1").await;

        // Only the known device produces an announcement.
        let snapshot = updates.recv().await.unwrap();
        assert_eq!(snapshot[1].health, Health::Unhealthy);
        assert!(updates.try_recv().is_err());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_propagator_can_be_restarted() {
        let channel = HealthChannel::new();
        let devices = table();

        let (first_tx, first_rx) = watch::channel(false);
        let first = channel.spawn_propagator(Arc::clone(&devices), first_rx);
        first_tx.send(true).unwrap();
        first.await.unwrap();

        let (second_tx, second_rx) = watch::channel(false);
        let mut updates = channel.snapshots().subscribe();
        let second = channel.spawn_propagator(Arc::clone(&devices), second_rx);

        channel.reporter().report_unhealthy("gpu1-1").await;
        let snapshot = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot[3].health, Health::Unhealthy);

        second_tx.send(true).unwrap();
        second.await.unwrap();
    }
}
