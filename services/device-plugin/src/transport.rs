//! Unix socket plumbing for the gRPC server and clients.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use hyper_util::rt::TokioIo;
use tokio::net::{UnixListener, UnixStream};
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

use crate::error::{PluginError, Result};

/// Timeout for the startup readiness check and for dialing the kubelet.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Remove a socket file left behind by a previous run.
///
/// A missing file is not an error.
pub fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PluginError::Bind {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Clean up and bind a fresh listener at `path`.
pub fn bind(path: &Path) -> Result<UnixListener> {
    remove_stale_socket(path)?;
    UnixListener::bind(path).map_err(|source| PluginError::Bind {
        path: path.to_path_buf(),
        source,
    })
}

/// Accept stream over a shared listener.
///
/// The listener outlives any single server run, so a crashed server can be
/// restarted on the same socket.
pub fn incoming(
    listener: Arc<UnixListener>,
) -> impl Stream<Item = std::io::Result<UnixStream>> + Send + Unpin + 'static {
    Box::pin(stream::unfold(listener, |listener| async move {
        let conn = listener.accept().await.map(|(stream, _addr)| stream);
        Some((conn, listener))
    }))
}

/// Open a gRPC channel over the unix socket at `path`.
///
/// Fails if no connection is established within `timeout`.
pub async fn dial(path: &Path, timeout: Duration) -> Result<Channel> {
    let socket: PathBuf = path.to_path_buf();
    let dial_error = |detail: String| PluginError::Dial {
        path: path.to_path_buf(),
        detail,
    };

    // The authority is ignored; every connection goes to the socket.
    let endpoint = Endpoint::from_static("http://[::]:50051").connect_timeout(timeout);

    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let socket = socket.clone();
        async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(socket).await?)) }
    }));

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(e)) => Err(dial_error(error_chain(&e))),
        Err(_) => Err(dial_error(format!("timed out after {timeout:?}"))),
    }
}

/// Render an error with all of its causes.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
