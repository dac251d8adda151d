//! Kubelet restart detection.
//!
//! The kubelet wipes the device plugin directory and recreates its socket
//! when it restarts, forgetting every registration. A filesystem watch on
//! the directory reports the re-creation; a periodic poll of the socket's
//! inode backs it up when watch events are lost or unavailable.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Buffered filesystem events. Overflow is harmless: the poll catches up.
const EVENT_BUFFER: usize = 64;

/// Change observed since the previous check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    Unchanged,
    /// The socket appeared or was replaced by a new file.
    Created,
    Removed,
}

/// Watches the kubelet registration socket for re-creation.
pub struct KubeletSocketWatcher {
    path: PathBuf,
    last_inode: Option<u64>,
    events: Option<mpsc::Receiver<Event>>,
    _watcher: Option<RecommendedWatcher>,
}

impl KubeletSocketWatcher {
    /// Watch `path`, taking its current state as the baseline.
    ///
    /// Without a usable filesystem watch only [`poll`](Self::poll) reports
    /// changes.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_inode = inode(&path);
        debug!(path = %path.display(), inode = ?last_inode, "Watching kubelet socket");

        let (watcher, events) = match setup_filesystem_watcher(&path) {
            Ok((watcher, events)) => (Some(watcher), Some(events)),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Filesystem watch unavailable, relying on polling"
                );
                (None, None)
            }
        };

        Self {
            path,
            last_inode,
            events,
            _watcher: watcher,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_watching(&self) -> bool {
        self._watcher.is_some()
    }

    /// Compare the socket with the last observation.
    pub fn poll(&mut self) -> SocketEvent {
        let current = inode(&self.path);
        let event = match (self.last_inode, current) {
            (previous, Some(now)) if previous != Some(now) => SocketEvent::Created,
            (Some(_), None) => SocketEvent::Removed,
            _ => SocketEvent::Unchanged,
        };
        self.last_inode = current;
        event
    }

    /// Wait for a filesystem event that changes the socket.
    ///
    /// Never resolves when no filesystem watch is active.
    pub async fn changed(&mut self) -> SocketEvent {
        loop {
            let Some(events) = self.events.as_mut() else {
                return std::future::pending().await;
            };

            let Some(event) = events.recv().await else {
                warn!("Filesystem watch closed, relying on polling");
                self.events = None;
                continue;
            };

            if !touches(&event, &self.path) {
                continue;
            }
            debug!(kind = ?event.kind, path = %self.path.display(), "Kubelet socket event");

            match self.poll() {
                SocketEvent::Unchanged => continue,
                change => return change,
            }
        }
    }
}

/// Whether `event` may have created, replaced or removed `path`.
fn touches(event: &Event, path: &Path) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(_) | EventKind::Any
    ) && event.paths.iter().any(|p| p == path)
}

/// Watch the socket's directory and forward its events to an async channel.
fn setup_filesystem_watcher(
    path: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::Receiver<Event>)> {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                // Dropped when full or closed; the next poll reconciles.
                let _ = tx.try_send(event);
            }
            Err(e) => warn!(error = %e, "Filesystem watch error"),
        },
        Config::default(),
    )?;

    let dir = path.parent().unwrap_or(Path::new("/"));
    watcher.watch(dir, RecursiveMode::NonRecursive)?;

    Ok((watcher, rx))
}

fn inode(path: &Path) -> Option<u64> {
    match std::fs::metadata(path) {
        Ok(metadata) => Some(metadata.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot stat kubelet socket");
            None
        }
    }
}
