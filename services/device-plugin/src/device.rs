//! Physical and virtual device records.
//!
//! Every physical GPU is advertised to the kubelet as `N` virtual devices with
//! ids of the form `<physical id>-<slot>`. The physical id is recovered by
//! cutting at the last `-`, so physical ids (NVML UUIDs) may contain dashes
//! themselves.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;

use tokio::sync::RwLock;
use vgpu_proto::deviceplugin::v1beta1 as api;

use crate::error::{PluginError, Result};

/// Separator between the physical id and the slot index.
pub const SLOT_SEPARATOR: char = '-';

/// A host GPU as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhysicalDevice {
    pub id: String,
}

impl PhysicalDevice {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Device health as reported to the kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Health {
    #[default]
    Healthy,
    Unhealthy,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => api::HEALTHY,
            Health::Unhealthy => api::UNHEALTHY,
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An allocatable unit advertised to the kubelet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDevice {
    pub id: String,
    pub health: Health,
}

impl VirtualDevice {
    fn new(physical: &PhysicalDevice, slot: u32) -> Self {
        Self {
            id: format!("{}{}{}", physical.id, SLOT_SEPARATOR, slot),
            health: Health::Healthy,
        }
    }

    /// Physical id this virtual device multiplexes.
    pub fn physical_id(&self) -> Result<&str> {
        physical_of(&self.id)
    }

    pub fn is_healthy(&self) -> bool {
        self.health == Health::Healthy
    }
}

impl From<&VirtualDevice> for api::Device {
    fn from(device: &VirtualDevice) -> Self {
        api::Device {
            id: device.id.clone(),
            health: device.health.as_str().to_string(),
            topology: None,
        }
    }
}

/// Expand physical devices into `per_device` virtual devices each.
///
/// Output order follows discovery order, then slot order. This is the order
/// reported to the kubelet.
pub fn derive_virtual(physical: &[PhysicalDevice], per_device: NonZeroU32) -> Vec<VirtualDevice> {
    physical
        .iter()
        .flat_map(|device| (0..per_device.get()).map(move |slot| VirtualDevice::new(device, slot)))
        .collect()
}

/// Recover the physical id from a virtual device id.
pub fn physical_of(virtual_id: &str) -> Result<&str> {
    let (physical, slot) = virtual_id
        .rsplit_once(SLOT_SEPARATOR)
        .ok_or_else(|| PluginError::MalformedId(virtual_id.to_string()))?;

    if physical.is_empty() || slot.is_empty() || !slot.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PluginError::MalformedId(virtual_id.to_string()));
    }

    Ok(physical)
}

// =============================================================================
// Device Table
// =============================================================================

struct TableInner {
    devices: Vec<VirtualDevice>,
    index: HashMap<String, usize>,
}

/// Ordered virtual devices keyed by id.
///
/// Health is the only mutable field and `mark_unhealthy` is the only way to
/// change it. Readers take consistent snapshots.
pub struct DeviceTable {
    inner: RwLock<TableInner>,
}

impl DeviceTable {
    pub fn new(devices: Vec<VirtualDevice>) -> Self {
        let index = devices
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();

        Self {
            inner: RwLock::new(TableInner { devices, index }),
        }
    }

    /// Copy of the full device sequence in advertised order.
    pub async fn snapshot(&self) -> Vec<VirtualDevice> {
        self.inner.read().await.devices.clone()
    }

    pub async fn health_of(&self, id: &str) -> Option<Health> {
        let inner = self.inner.read().await;
        inner.index.get(id).map(|&i| inner.devices[i].health)
    }

    /// Mark a device unhealthy.
    ///
    /// Returns `None` for an unknown id, otherwise whether the health changed.
    /// There is no way back to healthy.
    pub async fn mark_unhealthy(&self, id: &str) -> Option<bool> {
        let mut inner = self.inner.write().await;
        let i = *inner.index.get(id)?;
        let device = &mut inner.devices[i];
        let changed = device.health != Health::Unhealthy;
        device.health = Health::Unhealthy;
        Some(changed)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.devices.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Build the wire representation of a device list.
pub fn to_list_response(devices: &[VirtualDevice]) -> api::ListAndWatchResponse {
    api::ListAndWatchResponse {
        devices: devices.iter().map(api::Device::from).collect(),
    }
}

// =============================================================================
// Tests
// =============================================================================
