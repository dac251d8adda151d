//! Hardware fault watching through NVML critical XID events.
//!
//! Each GPU is registered for `CRITICAL_XID_ERROR` events. A fault on a GPU
//! degrades every virtual device carved from it. XIDs caused by the
//! application rather than the hardware are ignored.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nvml_wrapper::bitmasks::event::EventTypes;
use nvml_wrapper::enums::event::XidError;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::EventSet;
use nvml_wrapper::Nvml;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::device::VirtualDevice;
use crate::error::{PluginError, Result};
use crate::health::HealthReporter;

/// Environment variable listing health checks to turn off.
pub const DISABLE_HEALTHCHECKS_ENV: &str = "DP_DISABLE_HEALTHCHECKS";

/// XIDs triggered by user code, not by a failing GPU.
///
/// 13: graphics engine exception, 31: GPU memory page fault,
/// 43: GPU stopped processing, 45: preemptive cleanup,
/// 68: video processor exception.
pub const APPLICATION_XIDS: [u64; 5] = [13, 31, 43, 45, 68];

/// How long one blocking event wait lasts before cancellation is rechecked.
const EVENT_WAIT_TIMEOUT_MS: u32 = 5000;

/// Pause after a failed wait so a broken event set does not spin.
const WAIT_RETRY_DELAY: Duration = Duration::from_secs(1);

// =============================================================================
// Health Check Settings
// =============================================================================

/// Which health checks are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthChecks {
    pub xids: bool,
}

impl HealthChecks {
    /// Parse the value of `DP_DISABLE_HEALTHCHECKS`.
    ///
    /// `all` disables everything; a value mentioning `xids` disables the XID
    /// watcher. Matching is case-insensitive.
    pub fn from_disable_list(value: &str) -> Self {
        let value = value.trim().to_ascii_lowercase();
        let disabled = value == "all" || value.contains("xids");
        Self { xids: !disabled }
    }
}

impl Default for HealthChecks {
    fn default() -> Self {
        Self { xids: true }
    }
}

// =============================================================================
// Watcher Contract
// =============================================================================

/// Observes hardware and reports failing virtual devices.
#[async_trait]
pub trait FaultWatcher: Send + Sync {
    /// Watch `devices` until `cancel` is set.
    async fn watch(
        &self,
        devices: Vec<VirtualDevice>,
        reporter: HealthReporter,
        cancel: watch::Receiver<bool>,
    ) -> Result<()>;
}

/// Virtual devices affected by one XID event.
///
/// `physical` is the UUID of the GPU that raised the event, if NVML could
/// identify it. An unidentified device degrades everything.
pub fn affected_devices(
    devices: &[VirtualDevice],
    physical: Option<&str>,
    xid: Option<u64>,
) -> Vec<String> {
    if xid.is_some_and(|xid| APPLICATION_XIDS.contains(&xid)) {
        return Vec::new();
    }

    devices
        .iter()
        .filter(|device| match physical {
            Some(uuid) => device.physical_id().is_ok_and(|id| id == uuid),
            None => true,
        })
        .map(|device| device.id.clone())
        .collect()
}

/// Group virtual device ids by physical GPU.
fn by_physical(devices: &[VirtualDevice]) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for device in devices {
        if let Ok(physical) = device.physical_id() {
            groups
                .entry(physical.to_string())
                .or_default()
                .push(device.id.clone());
        }
    }
    groups
}

// =============================================================================
// Event Registration
// =============================================================================

/// Registers GPUs for critical XID events on one shared event set.
trait XidRegistry {
    type Set;

    fn create_set(&self) -> Result<Self::Set>;

    /// Add `physical` to `set`. The set is consumed; a failed registration
    /// leaves nothing behind to reuse.
    fn register(&self, physical: &str, set: Self::Set) -> std::result::Result<Self::Set, String>;
}

/// Build an event set covering every GPU that can be registered.
///
/// A failed registration frees the set, so it is rebuilt from scratch
/// without the failing GPU. Returns the set and the GPUs left out.
fn register_gpus<R: XidRegistry>(
    registry: &R,
    physical: &[&str],
) -> Result<(R::Set, Vec<String>)> {
    let mut failed: Vec<String> = Vec::new();

    'rebuild: loop {
        let mut set = registry.create_set()?;

        for uuid in physical {
            if failed.iter().any(|f| f == uuid) {
                continue;
            }
            set = match registry.register(uuid, set) {
                Ok(set) => set,
                Err(detail) => {
                    warn!(physical_id = %uuid, error = %detail, "Cannot watch XID events");
                    failed.push(uuid.to_string());
                    continue 'rebuild;
                }
            };
        }

        return Ok((set, failed));
    }
}

/// Raw XID carried by an event. An unknown value counts as critical.
fn xid_value(data: Option<XidError>) -> Option<u64> {
    match data {
        Some(XidError::Value(xid)) => Some(xid),
        Some(XidError::Unknown) | None => None,
    }
}

struct NvmlRegistry<'nvml> {
    nvml: &'nvml Nvml,
}

impl<'nvml> XidRegistry for NvmlRegistry<'nvml> {
    type Set = EventSet<'nvml>;

    fn create_set(&self) -> Result<Self::Set> {
        self.nvml
            .create_event_set()
            .map_err(|e| PluginError::Discovery(format!("nvml event set: {e}")))
    }

    fn register(&self, physical: &str, set: Self::Set) -> std::result::Result<Self::Set, String> {
        let device = self.nvml.device_by_uuid(physical).map_err(|e| e.to_string())?;
        device
            .register_events(EventTypes::CRITICAL_XID_ERROR, set)
            .map_err(|e| match e.source {
                Some(source) => format!("{}: {source}", e.error),
                None => e.error.to_string(),
            })
    }
}

// =============================================================================
// NVML Watcher
// =============================================================================

/// Watches NVML critical XID events.
pub struct NvmlXidWatcher {
    nvml: Arc<Nvml>,
}

impl NvmlXidWatcher {
    pub fn new(nvml: Arc<Nvml>) -> Self {
        Self { nvml }
    }
}

#[async_trait]
impl FaultWatcher for NvmlXidWatcher {
    async fn watch(
        &self,
        devices: Vec<VirtualDevice>,
        reporter: HealthReporter,
        cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        let nvml = Arc::clone(&self.nvml);
        tokio::task::spawn_blocking(move || watch_blocking(&nvml, &devices, &reporter, &cancel))
            .await
            .map_err(|e| PluginError::Discovery(format!("xid watcher task: {e}")))?
    }
}

fn report_all(reporter: &HealthReporter, ids: &[String]) -> bool {
    ids.iter()
        .all(|id| reporter.report_unhealthy_blocking(id.as_str()))
}

fn watch_blocking(
    nvml: &Nvml,
    devices: &[VirtualDevice],
    reporter: &HealthReporter,
    cancel: &watch::Receiver<bool>,
) -> Result<()> {
    let groups = by_physical(devices);
    let physical: Vec<&str> = groups.keys().map(String::as_str).collect();

    let (set, failed) = register_gpus(&NvmlRegistry { nvml }, &physical)?;
    for uuid in &failed {
        warn!(physical_id = %uuid, "Marking unwatchable GPU unhealthy");
        if let Some(ids) = groups.get(uuid) {
            if !report_all(reporter, ids) {
                return Ok(());
            }
        }
    }

    info!(gpus = physical.len() - failed.len(), "Watching XID events");

    while !*cancel.borrow() {
        let event = match set.wait(EVENT_WAIT_TIMEOUT_MS) {
            Ok(event) => event,
            Err(NvmlError::Timeout) => continue,
            Err(e) => {
                warn!(error = %e, "XID event wait failed");
                std::thread::sleep(WAIT_RETRY_DELAY);
                continue;
            }
        };

        if !event.event_type.contains(EventTypes::CRITICAL_XID_ERROR) {
            continue;
        }

        let xid = xid_value(event.event_data);
        let uuid = event.device.uuid().ok();
        let affected = affected_devices(devices, uuid.as_deref(), xid);
        if affected.is_empty() {
            debug!(xid = ?xid, physical_id = ?uuid, "Ignoring XID event");
            continue;
        }

        warn!(
            xid = ?xid,
            physical_id = ?uuid,
            affected = affected.len(),
            "Critical XID error, marking devices unhealthy"
        );
        if !report_all(reporter, &affected) {
            break;
        }
    }

    debug!("XID watcher stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use rstest::rstest;

    use super::*;
    use crate::device::{derive_virtual, PhysicalDevice};

    fn devices() -> Vec<VirtualDevice> {
        derive_virtual(
            &[
                PhysicalDevice::new("GPU-aaaa-1111"),
                PhysicalDevice::new("GPU-bbbb-2222"),
            ],
            NonZeroU32::new(3).unwrap(),
        )
    }

    #[rstest]
    #[case("", true)]
    #[case("all", false)]
    #[case("ALL", false)]
    #[case("xids", false)]
    #[case("power,xids", false)]
    #[case("power", true)]
    fn test_health_checks_from_disable_list(#[case] value: &str, #[case] xids: bool) {
        assert_eq!(HealthChecks::from_disable_list(value).xids, xids);
    }

    #[test]
    fn test_xid_on_known_gpu_degrades_its_slots() {
        let affected = affected_devices(&devices(), Some("GPU-bbbb-2222"), Some(79));
        assert_eq!(
            affected,
            vec!["GPU-bbbb-2222-0", "GPU-bbbb-2222-1", "GPU-bbbb-2222-2"]
        );
    }

    #[rstest]
    #[case(13)]
    #[case(31)]
    #[case(43)]
    #[case(45)]
    #[case(68)]
    fn test_application_xids_ignored(#[case] xid: u64) {
        assert!(affected_devices(&devices(), Some("GPU-aaaa-1111"), Some(xid)).is_empty());
        assert!(affected_devices(&devices(), None, Some(xid)).is_empty());
    }

    #[test]
    fn test_unidentified_device_degrades_everything() {
        assert_eq!(affected_devices(&devices(), None, Some(48)).len(), 6);
    }

    #[test]
    fn test_missing_xid_data_is_treated_as_critical() {
        assert_eq!(affected_devices(&devices(), Some("GPU-aaaa-1111"), None).len(), 3);
    }

    #[test]
    fn test_unknown_gpu_affects_nothing() {
        assert!(affected_devices(&devices(), Some("GPU-cccc"), Some(48)).is_empty());
    }

    #[rstest]
    #[case(Some(XidError::Value(79)), Some(79))]
    #[case(Some(XidError::Value(13)), Some(13))]
    #[case(Some(XidError::Unknown), None)]
    #[case(None, None)]
    fn test_xid_value(#[case] data: Option<XidError>, #[case] expected: Option<u64>) {
        assert_eq!(xid_value(data), expected);
    }

    #[test]
    fn test_unknown_xid_is_critical() {
        let xid = xid_value(Some(XidError::Unknown));
        assert_eq!(affected_devices(&devices(), Some("GPU-aaaa-1111"), xid).len(), 3);
    }

    /// In-memory registry: a set is the list of registered GPUs.
    struct FakeRegistry {
        broken: Vec<&'static str>,
        sets_created: std::cell::Cell<u32>,
    }

    impl FakeRegistry {
        fn new(broken: Vec<&'static str>) -> Self {
            Self {
                broken,
                sets_created: std::cell::Cell::new(0),
            }
        }
    }

    impl XidRegistry for FakeRegistry {
        type Set = Vec<String>;

        fn create_set(&self) -> Result<Self::Set> {
            self.sets_created.set(self.sets_created.get() + 1);
            Ok(Vec::new())
        }

        fn register(
            &self,
            physical: &str,
            mut set: Self::Set,
        ) -> std::result::Result<Self::Set, String> {
            if self.broken.contains(&physical) {
                return Err("not supported".to_string());
            }
            set.push(physical.to_string());
            Ok(set)
        }
    }

    #[test]
    fn test_register_all_gpus() {
        let registry = FakeRegistry::new(vec![]);
        let (set, failed) = register_gpus(&registry, &["gpu0", "gpu1", "gpu2"]).unwrap();
        assert_eq!(set, vec!["gpu0", "gpu1", "gpu2"]);
        assert!(failed.is_empty());
        assert_eq!(registry.sets_created.get(), 1);
    }

    #[test]
    fn test_failed_registration_keeps_earlier_gpus_watched() {
        let registry = FakeRegistry::new(vec!["gpu1"]);
        let (set, failed) = register_gpus(&registry, &["gpu0", "gpu1", "gpu2"]).unwrap();
        assert_eq!(set, vec!["gpu0", "gpu2"]);
        assert_eq!(failed, vec!["gpu1"]);
        assert_eq!(registry.sets_created.get(), 2);
    }

    #[test]
    fn test_every_gpu_failing_yields_empty_set() {
        let registry = FakeRegistry::new(vec!["gpu0", "gpu1"]);
        let (set, failed) = register_gpus(&registry, &["gpu0", "gpu1"]).unwrap();
        assert!(set.is_empty());
        assert_eq!(failed, vec!["gpu0", "gpu1"]);
    }

    #[test]
    fn test_group_by_physical() {
        let groups = by_physical(&devices());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["GPU-aaaa-1111"].len(), 3);
    }
}
