//! gRPC handlers for the kubelet-facing `DevicePlugin` service.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};
use vgpu_proto::deviceplugin::v1beta1::{
    self as api, AllocateRequest, AllocateResponse, DevicePlugin, DevicePluginOptions, Empty,
    ListAndWatchResponse, PreStartContainerRequest, PreStartContainerResponse,
};

use crate::allocation::{self, AllocationLayout};
use crate::device::{to_list_response, DeviceTable, VirtualDevice};
use crate::shutdown;

/// Outbound buffer per ListAndWatch stream.
const STREAM_BUFFER: usize = 4;

/// Handler state shared by every connection of one plugin run.
#[derive(Clone)]
pub struct DevicePluginService {
    devices: Arc<DeviceTable>,
    layout: Arc<AllocationLayout>,
    snapshots: broadcast::Sender<Vec<VirtualDevice>>,
    shutdown: watch::Receiver<bool>,
}

impl DevicePluginService {
    pub fn new(
        devices: Arc<DeviceTable>,
        layout: Arc<AllocationLayout>,
        snapshots: broadcast::Sender<Vec<VirtualDevice>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            devices,
            layout,
            snapshots,
            shutdown,
        }
    }
}

/// Push device lists to one kubelet stream until shutdown or disconnect.
async fn run_list_and_watch(
    devices: Arc<DeviceTable>,
    mut updates: broadcast::Receiver<Vec<VirtualDevice>>,
    mut shutdown: watch::Receiver<bool>,
    tx: mpsc::Sender<Result<ListAndWatchResponse, Status>>,
) {
    let initial = devices.snapshot().await;
    if tx.send(Ok(to_list_response(&initial))).await.is_err() {
        return;
    }
    debug!(count = initial.len(), "Sent initial device list");

    loop {
        let snapshot = tokio::select! {
            biased;

            _ = shutdown::signaled(&mut shutdown) => {
                debug!("ListAndWatch stream closing on shutdown");
                break;
            }

            _ = tx.closed() => {
                debug!("ListAndWatch client went away");
                break;
            }

            update = updates.recv() => match update {
                Ok(snapshot) => snapshot,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "ListAndWatch stream lagged, re-sending current list");
                    devices.snapshot().await
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let unhealthy = snapshot.iter().filter(|d| !d.is_healthy()).count();
        if tx.send(Ok(to_list_response(&snapshot))).await.is_err() {
            break;
        }
        info!(
            count = snapshot.len(),
            unhealthy, "Re-announced device list"
        );
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    type ListAndWatchStream = ReceiverStream<Result<ListAndWatchResponse, Status>>;

    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(DevicePluginOptions::default()))
    }

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        info!("Kubelet opened ListAndWatch stream");

        // Subscribe before the initial snapshot so no event falls in between.
        let updates = self.snapshots.subscribe();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(run_list_and_watch(
            Arc::clone(&self.devices),
            updates,
            self.shutdown.clone(),
            tx,
        ));

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let batch: Vec<Vec<String>> = request
            .into_inner()
            .container_requests
            .into_iter()
            .map(|req| req.devices_ids)
            .collect();

        let devices = self.devices.snapshot().await;
        let grants = allocation::allocate(&batch, &devices, &self.layout).map_err(|e| {
            warn!(reason = e.reason_code(), error = %e, "Rejected allocation request");
            Status::from(e)
        })?;

        for (requested, grant) in batch.iter().zip(&grants) {
            info!(
                requested = ?requested,
                visible_devices = grant.visible_devices().unwrap_or_default(),
                "Allocated devices"
            );
        }

        Ok(Response::new(AllocateResponse {
            container_responses: grants
                .into_iter()
                .map(api::ContainerAllocateResponse::from)
                .collect(),
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse::default()))
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;
    use std::time::Duration;

    use tokio_stream::StreamExt;
    use vgpu_proto::deviceplugin::v1beta1::ContainerAllocateRequest;

    use super::*;
    use crate::device::{derive_virtual, PhysicalDevice};

    struct Harness {
        service: DevicePluginService,
        devices: Arc<DeviceTable>,
        snapshots: broadcast::Sender<Vec<VirtualDevice>>,
        shutdown: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let devices = Arc::new(DeviceTable::new(derive_virtual(
            &[PhysicalDevice::new("gpu0"), PhysicalDevice::new("gpu1")],
            NonZeroU32::new(4).unwrap(),
        )));
        let (snapshots, _) = broadcast::channel(4);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let service = DevicePluginService::new(
            Arc::clone(&devices),
            Arc::new(AllocationLayout::default()),
            snapshots.clone(),
            shutdown_rx,
        );
        Harness {
            service,
            devices,
            snapshots,
            shutdown,
        }
    }

    fn allocate_request(groups: &[&[&str]]) -> Request<AllocateRequest> {
        Request::new(AllocateRequest {
            container_requests: groups
                .iter()
                .map(|ids| ContainerAllocateRequest {
                    devices_ids: ids.iter().map(|id| id.to_string()).collect(),
                })
                .collect(),
        })
    }

    #[tokio::test]
    async fn test_allocate_scenario() {
        let h = harness();

        let response = h
            .service
            .allocate(allocate_request(&[&["gpu0-0", "gpu0-2"], &["gpu0-0", "gpu1-1"]]))
            .await
            .unwrap()
            .into_inner();

        let visible: Vec<_> = response
            .container_responses
            .iter()
            .map(|r| r.envs["NVIDIA_VISIBLE_DEVICES"].as_str())
            .collect();
        assert_eq!(visible, vec!["gpu0", "gpu0,gpu1"]);
    }

    #[tokio::test]
    async fn test_allocate_unknown_aborts_batch() {
        let h = harness();
        let status = h
            .service
            .allocate(allocate_request(&[&["gpu0-0"], &["gpu5-0"]]))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().contains("gpu5-0"));
    }

    #[tokio::test]
    async fn test_allocate_unhealthy_rejected() {
        let h = harness();
        h.devices.mark_unhealthy("gpu1-2").await;

        let status = h
            .service
            .allocate(allocate_request(&[&["gpu1-2"]]))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_list_and_watch_initial_update_and_shutdown() {
        let h = harness();
        let mut stream = h
            .service
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.devices.len(), 8);
        assert!(first.devices.iter().all(|d| d.health == "Healthy"));

        h.devices.mark_unhealthy("gpu0-3").await;
        h.snapshots.send(h.devices.snapshot().await).unwrap();

        let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.devices[3].health, "Unhealthy");
        assert_eq!(
            second.devices.iter().filter(|d| d.health == "Healthy").count(),
            7
        );

        h.shutdown.send(true).unwrap();
        let end = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_trivial_handlers() {
        let h = harness();
        let options = h
            .service
            .get_device_plugin_options(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert!(!options.pre_start_required);

        h.service
            .pre_start_container(Request::new(PreStartContainerRequest {
                devices_ids: vec!["gpu0-0".to_string()],
            }))
            .await
            .unwrap();
    }
}
