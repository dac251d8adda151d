//! Configuration for the device plugin.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use vgpu_proto::deviceplugin::v1beta1::{DEVICE_PLUGIN_PATH, KUBELET_SOCKET_NAME};

use crate::allocation::{AllocationLayout, DEFAULT_DRIVER_ROOT, DEFAULT_VULKAN_ICD_ROOT};
use crate::logging::LogFormat;
use crate::plugin::{CrashPolicy, PluginOptions};
use crate::transport::DIAL_TIMEOUT;
use crate::xid::{HealthChecks, DISABLE_HEALTHCHECKS_ENV};

const DEFAULT_VGPU_COUNT: u32 = 10;
const DEFAULT_SOCKET_NAME: &str = "hkube-vgpu.sock";
const DEFAULT_RESOURCE_NAME: &str = "nvidia.com/gpu";
const DEFAULT_KUBELET_POLL_INTERVAL_SECS: u64 = 30;

/// Device plugin configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Virtual devices advertised per physical GPU.
    pub vgpu_count: NonZeroU32,

    /// Directory holding the plugin and kubelet sockets.
    pub device_plugin_dir: PathBuf,

    /// File name of the plugin socket.
    pub socket_name: String,

    /// File name of the kubelet registration socket.
    pub kubelet_socket_name: String,

    /// Extended resource advertised to the kubelet.
    pub resource_name: String,

    /// Physical device ids overriding NVML discovery.
    pub physical_devices: Option<Vec<String>>,

    /// Host directory with the NVIDIA driver libraries.
    pub driver_root: PathBuf,

    /// Host directory with the Vulkan ICD files.
    pub vulkan_icd_root: PathBuf,

    /// Seconds between fallback kubelet socket checks.
    pub kubelet_poll_interval_secs: u64,

    pub log_format: LogFormat,

    pub health_checks: HealthChecks,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let vgpu_count = match var("VGPU_COUNT") {
            Some(raw) => raw
                .trim()
                .parse::<NonZeroU32>()
                .with_context(|| format!("VGPU_COUNT must be a positive integer, got {raw:?}"))?,
            None => NonZeroU32::new(DEFAULT_VGPU_COUNT)
                .ok_or_else(|| anyhow!("default VGPU_COUNT is zero"))?,
        };

        let device_plugin_dir = var("VGPU_DEVICE_PLUGIN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEVICE_PLUGIN_PATH));

        let socket_name =
            var("VGPU_SOCKET_NAME").unwrap_or_else(|| DEFAULT_SOCKET_NAME.to_string());

        let kubelet_socket_name =
            var("VGPU_KUBELET_SOCKET_NAME").unwrap_or_else(|| KUBELET_SOCKET_NAME.to_string());

        let resource_name =
            var("VGPU_RESOURCE_NAME").unwrap_or_else(|| DEFAULT_RESOURCE_NAME.to_string());

        let physical_devices = var("VGPU_PHYSICAL_DEVICES").map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        });

        let driver_root = var("VGPU_DRIVER_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DRIVER_ROOT));

        let vulkan_icd_root = var("VGPU_VULKAN_ICD_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_VULKAN_ICD_ROOT));

        let kubelet_poll_interval_secs = match var("VGPU_KUBELET_POLL_INTERVAL") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .with_context(|| {
                    format!("VGPU_KUBELET_POLL_INTERVAL must be a positive integer, got {raw:?}")
                })?,
            None => DEFAULT_KUBELET_POLL_INTERVAL_SECS,
        };

        let log_format = match var("VGPU_LOG_FORMAT") {
            Some(raw) => raw.parse::<LogFormat>().context("invalid VGPU_LOG_FORMAT")?,
            None => LogFormat::default(),
        };

        let health_checks = var(DISABLE_HEALTHCHECKS_ENV)
            .map(|raw| HealthChecks::from_disable_list(&raw))
            .unwrap_or_default();

        Ok(Self {
            vgpu_count,
            device_plugin_dir,
            socket_name,
            kubelet_socket_name,
            resource_name,
            physical_devices,
            driver_root,
            vulkan_icd_root,
            kubelet_poll_interval_secs,
            log_format,
            health_checks,
        })
    }

    pub fn socket_path(&self) -> PathBuf {
        self.device_plugin_dir.join(&self.socket_name)
    }

    pub fn kubelet_socket_path(&self) -> PathBuf {
        self.device_plugin_dir.join(&self.kubelet_socket_name)
    }

    pub fn kubelet_poll_interval(&self) -> Duration {
        Duration::from_secs(self.kubelet_poll_interval_secs)
    }

    /// Plugin settings derived from this configuration.
    pub fn plugin_options(&self) -> PluginOptions {
        PluginOptions {
            socket: self.socket_path(),
            kubelet_socket: self.kubelet_socket_path(),
            resource_name: self.resource_name.clone(),
            layout: AllocationLayout::new(&self.driver_root, &self.vulkan_icd_root),
            dial_timeout: DIAL_TIMEOUT,
            crash_policy: CrashPolicy::default(),
        }
    }
}
