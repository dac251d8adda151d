//! Plugin lifecycle: start, register, serve and stop.
//!
//! ```text
//! Stopped ──start()──▶ Starting ──answers──▶ Serving ──stop()──▶ Stopping ──▶ Stopped
//!    ▲                    │ bind error / no answer
//!    └────────────────────┘
//! ```

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vgpu_proto::deviceplugin::v1beta1::{DevicePluginClient, Empty};

use super::service::DevicePluginService;
use super::supervisor::{self, CrashPolicy};
use crate::allocation::AllocationLayout;
use crate::device::{derive_virtual, DeviceTable, PhysicalDevice, VirtualDevice};
use crate::error::{PluginError, Result};
use crate::health::{HealthChannel, HealthReporter};
use crate::registration;
use crate::shutdown;
use crate::transport;

/// How long `stop()` waits for in-flight work before aborting tasks.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Serving,
    Stopping,
}

/// Static settings of a plugin instance.
#[derive(Debug, Clone)]
pub struct PluginOptions {
    /// Unix socket the plugin serves on.
    pub socket: PathBuf,

    /// Kubelet registration socket.
    pub kubelet_socket: PathBuf,

    /// Advertised resource name, e.g. `nvidia.com/gpu`.
    pub resource_name: String,

    /// Mounts and device nodes handed to every allocated container.
    pub layout: AllocationLayout,

    /// Timeout for the startup readiness check and the kubelet dial.
    pub dial_timeout: Duration,

    /// Restart budget for the gRPC server.
    pub crash_policy: CrashPolicy,
}

/// Tasks and signal belonging to one `start()`..`stop()` run.
struct RunningServer {
    shutdown: watch::Sender<bool>,
    server: JoinHandle<()>,
    propagator: JoinHandle<()>,
}

/// Device plugin advertising virtual GPUs to the kubelet.
pub struct VgpuDevicePlugin {
    options: PluginOptions,
    physical: Vec<PhysicalDevice>,
    devices: Arc<DeviceTable>,
    layout: Arc<AllocationLayout>,
    health: HealthChannel,
    state: LifecycleState,
    running: Option<RunningServer>,
}

impl VgpuDevicePlugin {
    /// Create a plugin advertising `per_device` virtual devices per GPU.
    pub fn new(
        physical: Vec<PhysicalDevice>,
        per_device: NonZeroU32,
        options: PluginOptions,
    ) -> Self {
        let virtual_devices = derive_virtual(&physical, per_device);
        info!(
            physical = physical.len(),
            per_device = per_device.get(),
            virtual_devices = virtual_devices.len(),
            "Derived virtual devices"
        );

        Self {
            layout: Arc::new(options.layout.clone()),
            options,
            physical,
            devices: Arc::new(DeviceTable::new(virtual_devices)),
            health: HealthChannel::new(),
            state: LifecycleState::Stopped,
            running: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn socket(&self) -> &std::path::Path {
        &self.options.socket
    }

    pub fn physical_devices(&self) -> &[PhysicalDevice] {
        &self.physical
    }

    pub fn device_table(&self) -> Arc<DeviceTable> {
        Arc::clone(&self.devices)
    }

    pub async fn devices(&self) -> Vec<VirtualDevice> {
        self.devices.snapshot().await
    }

    /// Handle for fault watchers.
    pub fn health_reporter(&self) -> HealthReporter {
        self.health.reporter()
    }

    /// Bind the socket, launch the supervised server and wait until it
    /// answers requests.
    pub async fn start(&mut self) -> Result<()> {
        self.start_with(|listener, service, shutdown, policy| {
            tokio::spawn(supervisor::supervise(listener, service, shutdown, policy))
        })
        .await
    }

    /// [`start`](Self::start) with the server task launched by `spawn_server`.
    async fn start_with<S>(&mut self, spawn_server: S) -> Result<()>
    where
        S: FnOnce(
            Arc<UnixListener>,
            DevicePluginService,
            watch::Receiver<bool>,
            CrashPolicy,
        ) -> JoinHandle<()>,
    {
        if self.state != LifecycleState::Stopped {
            return Err(PluginError::InvalidState("start requires a stopped plugin"));
        }
        self.state = LifecycleState::Starting;

        let listener = match transport::bind(&self.options.socket) {
            Ok(listener) => Arc::new(listener),
            Err(e) => {
                self.state = LifecycleState::Stopped;
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let service = DevicePluginService::new(
            Arc::clone(&self.devices),
            Arc::clone(&self.layout),
            self.health.snapshots(),
            shutdown_rx.clone(),
        );

        let propagator = self
            .health
            .spawn_propagator(Arc::clone(&self.devices), shutdown_rx.clone());
        let server = spawn_server(listener, service, shutdown_rx, self.options.crash_policy);

        self.running = Some(RunningServer {
            shutdown: shutdown_tx,
            server,
            propagator,
        });

        if let Err(detail) = self.check_serving().await {
            warn!(socket = %self.options.socket.display(), error = %detail, "Server did not come up");
            let _ = self.stop().await;
            return Err(PluginError::StartupTimeout {
                path: self.options.socket.clone(),
                detail,
            });
        }

        self.state = LifecycleState::Serving;
        info!(socket = %self.options.socket.display(), "Device plugin serving");
        Ok(())
    }

    /// Issue one request against our own socket within the dial timeout.
    async fn check_serving(&self) -> std::result::Result<(), String> {
        let timeout = self.options.dial_timeout;
        let request = async {
            let channel = transport::dial(&self.options.socket, timeout)
                .await
                .map_err(|e| e.to_string())?;
            DevicePluginClient::new(channel)
                .get_device_plugin_options(Empty {})
                .await
                .map_err(|status| status.message().to_string())?;
            Ok::<(), String>(())
        };

        match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(format!("no response within {timeout:?}")),
        }
    }

    /// Stop the server and remove the socket. A no-op when already stopped.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            debug!("Stop called on a stopped plugin");
            self.state = LifecycleState::Stopped;
            return Ok(());
        };
        self.state = LifecycleState::Stopping;
        info!(socket = %self.options.socket.display(), "Stopping device plugin");

        running.shutdown.send_replace(true);

        for (name, mut handle) in [("server", running.server), ("propagator", running.propagator)] {
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                warn!(task = name, "Task did not stop in time, aborting");
                handle.abort();
            }
        }

        let cleanup = transport::remove_stale_socket(&self.options.socket);
        self.state = LifecycleState::Stopped;
        cleanup
    }

    /// Announce the plugin to the kubelet.
    pub async fn register(&self) -> Result<()> {
        registration::register(
            &self.options.kubelet_socket,
            &self.options.socket,
            &self.options.resource_name,
            self.options.dial_timeout,
        )
        .await
    }

    /// Start and register. A plugin that cannot register is stopped again
    /// before the error is returned.
    pub async fn serve(&mut self) -> Result<()> {
        self.start().await?;

        if let Err(e) = self.register().await {
            warn!(error = %e, "Could not register device plugin, stopping");
            if let Err(stop_err) = self.stop().await {
                warn!(error = %stop_err, "Failed to stop after registration failure");
            }
            return Err(e);
        }

        info!(
            resource_name = %self.options.resource_name,
            "Registered device plugin with kubelet"
        );
        Ok(())
    }
}
