//! Physical GPU discovery.
//!
//! Enumeration sits behind [`DeviceEnumerator`]. Production uses NVML; a
//! static list can be supplied through configuration for hosts (and tests)
//! where the NVIDIA management library is not loaded.

use std::collections::HashSet;
use std::sync::Arc;

use nvml_wrapper::Nvml;
use tracing::{info, warn};

use crate::device::PhysicalDevice;
use crate::error::{PluginError, Result};

/// Lists the accelerators present on the host.
pub trait DeviceEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<PhysicalDevice>>;
}

/// Enumerates GPUs through NVML, identified by UUID.
pub struct NvmlEnumerator {
    nvml: Arc<Nvml>,
}

impl NvmlEnumerator {
    pub fn new(nvml: Arc<Nvml>) -> Self {
        Self { nvml }
    }

    /// Load NVML. Fails if the driver library is unavailable.
    pub fn init() -> Result<Self> {
        let nvml = Nvml::init().map_err(|e| PluginError::Discovery(format!("nvml init: {e}")))?;
        Ok(Self::new(Arc::new(nvml)))
    }

    pub fn nvml(&self) -> Arc<Nvml> {
        Arc::clone(&self.nvml)
    }
}

impl DeviceEnumerator for NvmlEnumerator {
    fn enumerate(&self) -> Result<Vec<PhysicalDevice>> {
        let count = self
            .nvml
            .device_count()
            .map_err(|e| PluginError::Discovery(format!("nvml device count: {e}")))?;

        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = self
                .nvml
                .device_by_index(index)
                .map_err(|e| PluginError::Discovery(format!("nvml device {index}: {e}")))?;
            let uuid = device
                .uuid()
                .map_err(|e| PluginError::Discovery(format!("nvml device {index} uuid: {e}")))?;
            devices.push(PhysicalDevice::new(uuid));
        }

        Ok(devices)
    }
}

/// Fixed device list, e.g. from `VGPU_PHYSICAL_DEVICES`.
#[derive(Debug, Clone, Default)]
pub struct StaticEnumerator {
    ids: Vec<String>,
}

impl StaticEnumerator {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl DeviceEnumerator for StaticEnumerator {
    fn enumerate(&self) -> Result<Vec<PhysicalDevice>> {
        Ok(self.ids.iter().cloned().map(PhysicalDevice::new).collect())
    }
}

/// Discover physical devices and validate that their ids are usable.
pub fn discover_physical(enumerator: &dyn DeviceEnumerator) -> Result<Vec<PhysicalDevice>> {
    let devices = enumerator.enumerate()?;

    let mut seen = HashSet::new();
    for device in &devices {
        if device.id.is_empty() {
            return Err(PluginError::Discovery("empty physical device id".to_string()));
        }
        if !seen.insert(device.id.as_str()) {
            return Err(PluginError::Discovery(format!(
                "duplicate physical device id: {}",
                device.id
            )));
        }
    }

    if devices.is_empty() {
        warn!("No physical GPUs discovered, advertising an empty device list");
    } else {
        info!(
            count = devices.len(),
            devices = ?devices.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            "Discovered physical GPUs"
        );
    }

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unavailable;

    impl DeviceEnumerator for Unavailable {
        fn enumerate(&self) -> Result<Vec<PhysicalDevice>> {
            Err(PluginError::Discovery("driver not loaded".to_string()))
        }
    }

    #[test]
    fn test_static_enumerator_preserves_order() {
        let devices = discover_physical(&StaticEnumerator::new(["gpu1", "gpu0"])).unwrap();
        assert_eq!(
            devices,
            vec![PhysicalDevice::new("gpu1"), PhysicalDevice::new("gpu0")]
        );
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = discover_physical(&StaticEnumerator::new(["gpu0", "gpu0"])).unwrap_err();
        assert_eq!(err.reason_code(), "discovery_failed");
    }

    #[test]
    fn test_empty_id_rejected() {
        assert!(discover_physical(&StaticEnumerator::new([""])).is_err());
    }

    #[test]
    fn test_enumerator_failure_propagates() {
        let err = discover_physical(&Unavailable).unwrap_err();
        assert!(err.to_string().contains("driver not loaded"));
    }

    #[test]
    fn test_no_devices_is_allowed() {
        let devices = discover_physical(&StaticEnumerator::default()).unwrap();
        assert!(devices.is_empty());
    }
}
