//! The kubelet-facing device plugin.
//!
//! - `lifecycle`: socket ownership, start/stop/serve state machine
//! - `service`: `DevicePlugin` gRPC handlers
//! - `supervisor`: crash-restart loop around the gRPC server

mod lifecycle;
mod service;
mod supervisor;

pub use lifecycle::{LifecycleState, PluginOptions, VgpuDevicePlugin};
pub use service::DevicePluginService;
pub use supervisor::{CrashBudget, CrashPolicy, RestartDecision};
