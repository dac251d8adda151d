//! Generated bindings for the kubelet device plugin API.

pub mod deviceplugin {
    pub mod v1beta1 {
        tonic::include_proto!("v1beta1");

        pub use device_plugin_client::DevicePluginClient;
        pub use device_plugin_server::{DevicePlugin, DevicePluginServer};
        pub use registration_client::RegistrationClient;
        pub use registration_server::{Registration, RegistrationServer};

        /// API version sent in `RegisterRequest.version`.
        pub const VERSION: &str = "v1beta1";

        /// Directory holding the kubelet socket and every plugin socket.
        pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

        /// File name of the kubelet registration socket.
        pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

        /// `Device.health` value for a usable device.
        pub const HEALTHY: &str = "Healthy";

        /// `Device.health` value for a device that must not be allocated.
        pub const UNHEALTHY: &str = "Unhealthy";
    }
}
