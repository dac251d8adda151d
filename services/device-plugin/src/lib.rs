//! vGPU device plugin
//!
//! Advertises a pool of virtual GPUs to the kubelet over the device plugin
//! API and decides, per container, which physical GPUs and device files a
//! workload receives. Every physical GPU is exposed as a fixed number of
//! virtual devices named `<physical id>-<slot>`.
//!
//! ## Architecture
//!
//! - **Discovery**: enumerates physical GPUs (NVML or a static list)
//! - **Device Table**: virtual devices and their health, shared by all handlers
//! - **Plugin**: serves the `DevicePlugin` gRPC API on a unix socket, restarts
//!   the server after crashes and registers with the kubelet
//! - **Allocation**: maps requested virtual ids to visible GPUs, mounts and
//!   device nodes
//! - **Health**: fault watchers report devices that are then re-announced as
//!   unhealthy on every open ListAndWatch stream

pub mod allocation;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod health;
pub mod kubelet;
pub mod logging;
pub mod plugin;
pub mod registration;
pub mod shutdown;
pub mod transport;
pub mod xid;

pub use device::{DeviceTable, Health, PhysicalDevice, VirtualDevice};
pub use error::{PluginError, Result};
pub use plugin::{LifecycleState, PluginOptions, VgpuDevicePlugin};
