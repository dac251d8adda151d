//! vGPU device plugin daemon.
//!
//! Runs on every GPU node. Discovers the GPUs, serves and registers the
//! device plugin, and serves again whenever the kubelet restarts (its socket
//! is recreated) or on `SIGHUP`. `SIGINT`, `SIGTERM` and `SIGQUIT` stop the
//! plugin and exit.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use vgpu_device_plugin::config::Config;
use vgpu_device_plugin::discovery::{
    discover_physical, DeviceEnumerator, NvmlEnumerator, StaticEnumerator,
};
use vgpu_device_plugin::kubelet::{KubeletSocketWatcher, SocketEvent};
use vgpu_device_plugin::xid::{FaultWatcher, NvmlXidWatcher};
use vgpu_device_plugin::{logging, shutdown, PhysicalDevice, VgpuDevicePlugin};

/// Plugin version (semver).
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long to wait for the fault watcher after cancelling it.
const WATCHER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// What the control loop does after a run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Restart,
    Exit,
}

struct Signals {
    hangup: Signal,
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
}

impl Signals {
    fn install() -> Result<Self> {
        Ok(Self {
            hangup: signal(SignalKind::hangup()).context("install SIGHUP handler")?,
            interrupt: signal(SignalKind::interrupt()).context("install SIGINT handler")?,
            terminate: signal(SignalKind::terminate()).context("install SIGTERM handler")?,
            quit: signal(SignalKind::quit()).context("install SIGQUIT handler")?,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(config.log_format);
    info!(version = VERSION, "Starting vGPU device plugin");

    match run(config).await {
        Ok(()) => {
            info!("Device plugin shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Device plugin failed");
            for cause in e.chain().skip(1) {
                error!(cause = %cause, "caused by");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!(
        vgpu_count = config.vgpu_count.get(),
        socket = %config.socket_path().display(),
        kubelet_socket = %config.kubelet_socket_path().display(),
        resource_name = %config.resource_name,
        "Configuration loaded"
    );

    let (enumerator, nvml): (Box<dyn DeviceEnumerator>, _) = match &config.physical_devices {
        Some(ids) => {
            info!(count = ids.len(), "Using configured physical devices");
            (Box::new(StaticEnumerator::new(ids.clone())), None)
        }
        None => {
            let enumerator = NvmlEnumerator::init().context("failed to load NVML")?;
            let nvml = enumerator.nvml();
            (Box::new(enumerator), Some(nvml))
        }
    };
    let physical = discover_physical(enumerator.as_ref()).context("GPU discovery failed")?;

    let watcher: Option<Arc<dyn FaultWatcher>> = match (config.health_checks.xids, nvml) {
        (true, Some(nvml)) => Some(Arc::new(NvmlXidWatcher::new(nvml))),
        (true, None) => {
            info!("XID health checks need NVML, not watching configured devices");
            None
        }
        (false, _) => {
            info!("XID health checks disabled");
            None
        }
    };

    let mut signals = Signals::install()?;
    let mut kubelet = KubeletSocketWatcher::new(config.kubelet_socket_path());

    loop {
        let next = run_once(&config, &physical, watcher.clone(), &mut kubelet, &mut signals).await?;
        if next == Next::Exit {
            return Ok(());
        }
        info!("Restarting device plugin");
    }
}

/// Serve one plugin instance until a restart or exit is requested.
async fn run_once(
    config: &Config,
    physical: &[PhysicalDevice],
    watcher: Option<Arc<dyn FaultWatcher>>,
    kubelet: &mut KubeletSocketWatcher,
    signals: &mut Signals,
) -> Result<Next> {
    let mut plugin =
        VgpuDevicePlugin::new(physical.to_vec(), config.vgpu_count, config.plugin_options());

    let (cancel_tx, cancel_rx) = shutdown::channel();
    let mut watcher_task: Option<JoinHandle<()>> = None;

    match plugin.serve().await {
        Ok(()) => {
            if let Some(watcher) = watcher {
                let devices = plugin.devices().await;
                let reporter = plugin.health_reporter();
                watcher_task = Some(tokio::spawn(async move {
                    if let Err(e) = watcher.watch(devices, reporter, cancel_rx).await {
                        warn!(error = %e, "Fault watcher stopped");
                    }
                }));
            }
        }
        Err(e) => {
            warn!(
                error = %e,
                reason = e.reason_code(),
                "Could not contact kubelet, waiting for it to restart. Is the device plugin feature gate enabled?"
            );
        }
    }

    let next = wait_for_event(config.kubelet_poll_interval(), kubelet, signals).await;

    cancel_tx.send_replace(true);
    if let Some(task) = watcher_task {
        if tokio::time::timeout(WATCHER_STOP_TIMEOUT, task).await.is_err() {
            warn!("Fault watcher did not stop in time");
        }
    }

    plugin.stop().await.context("failed to stop device plugin")?;
    Ok(next)
}

async fn wait_for_event(
    poll_interval: Duration,
    kubelet: &mut KubeletSocketWatcher,
    signals: &mut Signals,
) -> Next {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            event = kubelet.changed() => event,
            _ = ticker.tick() => kubelet.poll(),
            _ = signals.hangup.recv() => {
                info!("Received SIGHUP, restarting");
                return Next::Restart;
            }
            _ = signals.interrupt.recv() => {
                info!("Received SIGINT, shutting down");
                return Next::Exit;
            }
            _ = signals.terminate.recv() => {
                info!("Received SIGTERM, shutting down");
                return Next::Exit;
            }
            _ = signals.quit.recv() => {
                info!("Received SIGQUIT, shutting down");
                return Next::Exit;
            }
        };

        match event {
            SocketEvent::Created => {
                info!(path = %kubelet.path().display(), "Kubelet socket created");
                return Next::Restart;
            }
            SocketEvent::Removed => {
                info!(path = %kubelet.path().display(), "Kubelet socket removed");
            }
            SocketEvent::Unchanged => {}
        }
    }
}
