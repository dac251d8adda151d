//! Allocation decisions.
//!
//! Turns the virtual device ids the kubelet picked for a container into the
//! environment, mounts and device nodes the container needs. Several virtual
//! devices may share one physical GPU, so the grant is driven by the set of
//! physical ids, not by the slots.
//!
//! Everything here is pure: callers pass a snapshot of the device table.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use vgpu_proto::deviceplugin::v1beta1 as api;

use crate::device::{physical_of, VirtualDevice};
use crate::error::{PluginError, Result};

/// Environment variable read by the NVIDIA container runtime.
pub const VISIBLE_DEVICES_ENV: &str = "NVIDIA_VISIBLE_DEVICES";

/// Default host directory holding the driver userspace.
pub const DEFAULT_DRIVER_ROOT: &str = "/home/kubernetes/bin/nvidia";

/// Default host directory holding the Vulkan ICD manifests.
pub const DEFAULT_VULKAN_ICD_ROOT: &str = "/home/kubernetes/bin/vulkan/icd.d";

const DEVICE_NODE_PERMISSIONS: &str = "mrw";

/// Host to container bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountGrant {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

impl MountGrant {
    pub fn read_write(host_path: impl Into<PathBuf>, container_path: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }
}

/// Host to container device node with cgroup permissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNodeGrant {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub permissions: String,
}

impl DeviceNodeGrant {
    /// Same path on both sides with `mrw` permissions.
    pub fn passthrough(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            host_path: path.clone(),
            container_path: path,
            permissions: DEVICE_NODE_PERMISSIONS.to_string(),
        }
    }
}

/// Mounts and device nodes every allocated container receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationLayout {
    pub mounts: Vec<MountGrant>,
    pub device_nodes: Vec<DeviceNodeGrant>,
}

impl AllocationLayout {
    pub fn new(driver_root: impl Into<PathBuf>, vulkan_icd_root: impl Into<PathBuf>) -> Self {
        Self {
            mounts: vec![
                MountGrant::read_write(driver_root, "/usr/local/nvidia"),
                MountGrant::read_write(vulkan_icd_root, "/etc/vulkan/icd.d"),
            ],
            device_nodes: vec![
                DeviceNodeGrant::passthrough("/dev/nvidia0"),
                DeviceNodeGrant::passthrough("/dev/nvidiactl"),
                DeviceNodeGrant::passthrough("/dev/nvidia-uvm"),
            ],
        }
    }
}

impl Default for AllocationLayout {
    fn default() -> Self {
        Self::new(DEFAULT_DRIVER_ROOT, DEFAULT_VULKAN_ICD_ROOT)
    }
}

/// Resources granted to one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerGrant {
    pub envs: BTreeMap<String, String>,
    pub mounts: Vec<MountGrant>,
    pub device_nodes: Vec<DeviceNodeGrant>,
}

impl ContainerGrant {
    pub fn visible_devices(&self) -> Option<&str> {
        self.envs.get(VISIBLE_DEVICES_ENV).map(String::as_str)
    }
}

impl From<ContainerGrant> for api::ContainerAllocateResponse {
    fn from(grant: ContainerGrant) -> Self {
        api::ContainerAllocateResponse {
            envs: grant.envs.into_iter().collect::<HashMap<_, _>>(),
            mounts: grant
                .mounts
                .into_iter()
                .map(|m| api::Mount {
                    container_path: m.container_path.to_string_lossy().into_owned(),
                    host_path: m.host_path.to_string_lossy().into_owned(),
                    read_only: m.read_only,
                })
                .collect(),
            devices: grant
                .device_nodes
                .into_iter()
                .map(|d| api::DeviceSpec {
                    container_path: d.container_path.to_string_lossy().into_owned(),
                    host_path: d.host_path.to_string_lossy().into_owned(),
                    permissions: d.permissions,
                })
                .collect(),
            annotations: HashMap::new(),
        }
    }
}

/// Decide the grant for a single container request.
pub fn allocate_container<S: AsRef<str>>(
    requested: &[S],
    devices: &[VirtualDevice],
    layout: &AllocationLayout,
) -> Result<ContainerGrant> {
    if requested.is_empty() {
        return Err(PluginError::EmptyRequest);
    }

    let matched = requested
        .iter()
        .map(|id| {
            let id = id.as_ref();
            devices
                .iter()
                .find(|d| d.id == id)
                .ok_or_else(|| PluginError::UnknownDevice(id.to_string()))
        })
        .collect::<Result<Vec<_>>>()?;

    if let Some(device) = matched.iter().find(|d| !d.is_healthy()) {
        return Err(PluginError::UnhealthyDevice(device.id.clone()));
    }

    let physical = matched
        .iter()
        .map(|d| physical_of(&d.id))
        .collect::<Result<BTreeSet<_>>>()?;

    let visible = physical.into_iter().collect::<Vec<_>>().join(",");

    Ok(ContainerGrant {
        envs: BTreeMap::from([(VISIBLE_DEVICES_ENV.to_string(), visible)]),
        mounts: layout.mounts.clone(),
        device_nodes: layout.device_nodes.clone(),
    })
}

/// Decide grants for every container of one `Allocate` call.
///
/// Any failing container fails the whole batch.
pub fn allocate<S: AsRef<str>>(
    batch: &[Vec<S>],
    devices: &[VirtualDevice],
    layout: &AllocationLayout,
) -> Result<Vec<ContainerGrant>> {
    batch
        .iter()
        .map(|requested| allocate_container(requested, devices, layout))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
