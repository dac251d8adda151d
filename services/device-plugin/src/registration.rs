//! Registration with the kubelet.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};
use vgpu_proto::deviceplugin::v1beta1::{
    DevicePluginOptions, RegisterRequest, RegistrationClient, VERSION,
};

use crate::error::{PluginError, Result};
use crate::transport;

/// Build the registration payload for a plugin listening on `plugin_socket`.
///
/// The kubelet expects the socket file name relative to its device plugin
/// directory.
pub fn register_request(plugin_socket: &Path, resource_name: &str) -> RegisterRequest {
    let endpoint = plugin_socket
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    RegisterRequest {
        version: VERSION.to_string(),
        endpoint,
        resource_name: resource_name.to_string(),
        options: Some(DevicePluginOptions::default()),
    }
}

/// Announce the plugin to the kubelet listening on `kubelet_socket`.
pub async fn register(
    kubelet_socket: &Path,
    plugin_socket: &Path,
    resource_name: &str,
    timeout: Duration,
) -> Result<()> {
    let channel = transport::dial(kubelet_socket, timeout).await.map_err(|e| {
        warn!(endpoint = %kubelet_socket.display(), error = %e, "Failed to dial kubelet");
        PluginError::Registration(e.to_string())
    })?;

    let request = register_request(plugin_socket, resource_name);
    info!(
        endpoint = %request.endpoint,
        resource_name = %request.resource_name,
        version = %request.version,
        "Registering with kubelet"
    );

    RegistrationClient::new(channel)
        .register(request)
        .await
        .map_err(|status| {
            warn!(code = ?status.code(), message = %status.message(), "Kubelet rejected registration");
            PluginError::Registration(format!("{}: {}", status.code(), status.message()))
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_request_uses_socket_basename() {
        let request = register_request(
            Path::new("/var/lib/kubelet/device-plugins/vgpu.sock"),
            "nvidia.com/gpu",
        );

        assert_eq!(request.version, "v1beta1");
        assert_eq!(request.endpoint, "vgpu.sock");
        assert_eq!(request.resource_name, "nvidia.com/gpu");
        assert!(!request.options.unwrap().pre_start_required);
    }

    #[tokio::test]
    async fn test_register_without_kubelet_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = register(
            &dir.path().join("kubelet.sock"),
            &dir.path().join("vgpu.sock"),
            "nvidia.com/gpu",
            Duration::from_millis(500),
        )
        .await
        .unwrap_err();

        assert_eq!(err.reason_code(), "registration_failed");
    }
}
