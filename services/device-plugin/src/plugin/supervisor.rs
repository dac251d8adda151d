//! Crash-restart supervision for the gRPC server.
//!
//! The server run loop is restarted whenever it returns without a shutdown
//! having been requested. Restarts are bounded by a rolling crash budget: a
//! crash more than `window` after the previous one resets the count, and
//! exceeding `max_restarts` within the window is fatal for the process. The
//! kubelet DaemonSet is expected to restart the agent.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UnixListener;
use tokio::sync::watch;
use tonic::transport::Server;
use tracing::{error, info, warn};
use vgpu_proto::deviceplugin::v1beta1::DevicePluginServer;

use super::service::DevicePluginService;
use crate::shutdown;
use crate::transport;

// =============================================================================
// Crash Budget
// =============================================================================

/// Limits on automatic server restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashPolicy {
    /// Restarts tolerated within `window`.
    pub max_restarts: u32,

    /// A crash later than this after the previous one starts a fresh count.
    pub window: Duration,
}

impl Default for CrashPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(3600),
        }
    }
}

/// Outcome of recording a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart the server; `restart_count` crashes so far in this window.
    Restart { restart_count: u32 },
    /// The server is unstable; terminate the process.
    GiveUp { restart_count: u32 },
}

/// Rolling crash counter.
#[derive(Debug, Clone)]
pub struct CrashBudget {
    policy: CrashPolicy,
    restart_count: u32,
    last_crash: Instant,
}

impl CrashBudget {
    /// Start a budget; the first crash is measured from `started_at`.
    pub fn new(policy: CrashPolicy, started_at: Instant) -> Self {
        Self {
            policy,
            restart_count: 0,
            last_crash: started_at,
        }
    }

    /// Record a crash observed at `now`.
    pub fn record_crash(&mut self, now: Instant) -> RestartDecision {
        let since_last = now.saturating_duration_since(self.last_crash);
        self.last_crash = now;

        if since_last >= self.policy.window {
            self.restart_count = 1;
        } else {
            self.restart_count += 1;
        }

        if self.restart_count > self.policy.max_restarts {
            RestartDecision::GiveUp {
                restart_count: self.restart_count,
            }
        } else {
            RestartDecision::Restart {
                restart_count: self.restart_count,
            }
        }
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }
}

// =============================================================================
// Server Supervisor
// =============================================================================

/// How a supervised server loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SupervisorExit {
    /// Shutdown was requested.
    Shutdown,
    /// The crash budget was exhausted.
    GaveUp { restart_count: u32 },
}

/// Serve `service` on `listener` until shutdown, restarting after crashes.
///
/// Exits the process once the crash budget is exhausted.
pub(crate) async fn supervise(
    listener: Arc<UnixListener>,
    service: DevicePluginService,
    shutdown: watch::Receiver<bool>,
    policy: CrashPolicy,
) {
    let stop_signal = shutdown.clone();
    let serve = move || {
        let mut stop = stop_signal.clone();
        Server::builder()
            .add_service(DevicePluginServer::new(service.clone()))
            .serve_with_incoming_shutdown(transport::incoming(Arc::clone(&listener)), async move {
                shutdown::signaled(&mut stop).await;
            })
    };

    if let SupervisorExit::GaveUp { .. } = supervise_with(serve, shutdown, policy).await {
        std::process::exit(1);
    }
}

/// Run `serve` until shutdown, running it again each time it returns early.
pub(crate) async fn supervise_with<F, Fut, E>(
    mut serve: F,
    shutdown: watch::Receiver<bool>,
    policy: CrashPolicy,
) -> SupervisorExit
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
    E: std::error::Error,
{
    let mut budget = CrashBudget::new(policy, Instant::now());

    loop {
        info!("Starting gRPC server");

        let result = serve().await;

        if *shutdown.borrow() {
            info!("gRPC server stopped");
            return SupervisorExit::Shutdown;
        }

        match result {
            Ok(()) => warn!("gRPC server exited unexpectedly"),
            Err(e) => warn!(error = %transport::error_chain(&e), "gRPC server crashed"),
        }

        match budget.record_crash(Instant::now()) {
            RestartDecision::Restart { restart_count } => {
                info!(restart_count, "Restarting gRPC server");
            }
            RestartDecision::GiveUp { restart_count } => {
                error!(
                    restart_count,
                    window_secs = policy.window.as_secs(),
                    "gRPC server has repeatedly crashed recently, quitting"
                );
                return SupervisorExit::GaveUp { restart_count };
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tempfile::tempdir;
    use tokio::net::UnixStream;

    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_default_policy() {
        let policy = CrashPolicy::default();
        assert_eq!(policy.max_restarts, 5);
        assert_eq!(policy.window, HOUR);
    }

    #[test]
    fn test_sixth_crash_within_window_is_fatal() {
        let start = Instant::now();
        let mut budget = CrashBudget::new(CrashPolicy::default(), start);

        for i in 1..=5 {
            let decision = budget.record_crash(start + Duration::from_secs(i * 60));
            assert_eq!(decision, RestartDecision::Restart { restart_count: i as u32 });
        }

        assert_eq!(
            budget.record_crash(start + Duration::from_secs(360)),
            RestartDecision::GiveUp { restart_count: 6 }
        );
    }

    #[test]
    fn test_sparse_crashes_never_fatal() {
        let start = Instant::now();
        let mut budget = CrashBudget::new(CrashPolicy::default(), start);

        for i in 1..=12u32 {
            let at = start + (HOUR + Duration::from_secs(1)) * i;
            assert_eq!(
                budget.record_crash(at),
                RestartDecision::Restart { restart_count: 1 }
            );
        }
    }

    #[test]
    fn test_quiet_hour_resets_count() {
        let start = Instant::now();
        let mut budget = CrashBudget::new(CrashPolicy::default(), start);

        for i in 1..=5 {
            budget.record_crash(start + Duration::from_secs(i));
        }
        assert_eq!(budget.restart_count(), 5);

        let later = start + Duration::from_secs(5) + HOUR;
        assert_eq!(
            budget.record_crash(later),
            RestartDecision::Restart { restart_count: 1 }
        );
        assert_eq!(
            budget.record_crash(later + Duration::from_secs(1)),
            RestartDecision::Restart { restart_count: 2 }
        );
    }

    #[test]
    fn test_window_measured_from_previous_crash() {
        let start = Instant::now();
        let policy = CrashPolicy {
            max_restarts: 1,
            window: Duration::from_secs(10),
        };
        let mut budget = CrashBudget::new(policy, start);

        // Each gap is shorter than the window even though the total is not.
        assert_eq!(
            budget.record_crash(start + Duration::from_secs(9)),
            RestartDecision::Restart { restart_count: 1 }
        );
        assert_eq!(
            budget.record_crash(start + Duration::from_secs(18)),
            RestartDecision::GiveUp { restart_count: 2 }
        );
    }

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    #[tokio::test]
    async fn test_server_is_served_again_after_returning() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vgpu.sock");
        let listener = Arc::new(transport::bind(&path).unwrap());
        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let runs = counter();

        // Each run handles one connection, then fails.
        let serve = {
            let runs = Arc::clone(&runs);
            let stop_signal = shutdown_rx.clone();
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
                let listener = Arc::clone(&listener);
                let mut stop = stop_signal.clone();
                async move {
                    tokio::select! {
                        _ = listener.accept() => {
                            Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection handler panicked"))
                        }
                        _ = shutdown::signaled(&mut stop) => Ok(()),
                    }
                }
            }
        };
        let supervisor = tokio::spawn(supervise_with(serve, shutdown_rx, CrashPolicy::default()));

        let _first = UnixStream::connect(&path).await.unwrap();
        let _second = UnixStream::connect(&path).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while runs.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send_replace(true);
        let exit = tokio::time::timeout(Duration::from_secs(5), supervisor)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, SupervisorExit::Shutdown);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_six_quick_crashes_give_up() {
        let (_shutdown_tx, shutdown_rx) = shutdown::channel();
        let runs = counter();

        let serve = {
            let runs = Arc::clone(&runs);
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err::<(), _>(io::Error::other("accept failed")))
            }
        };

        let exit = tokio::time::timeout(
            Duration::from_secs(5),
            supervise_with(serve, shutdown_rx, CrashPolicy::default()),
        )
        .await
        .unwrap();
        assert_eq!(exit, SupervisorExit::GaveUp { restart_count: 6 });
        assert_eq!(runs.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_return_after_shutdown_is_not_a_crash() {
        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let policy = CrashPolicy {
            max_restarts: 0,
            window: HOUR,
        };
        let runs = counter();

        let serve = {
            let runs = Arc::clone(&runs);
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
                shutdown_tx.send_replace(true);
                std::future::ready(Err::<(), _>(io::Error::other("listener closed")))
            }
        };

        let exit = supervise_with(serve, shutdown_rx, policy).await;
        assert_eq!(exit, SupervisorExit::Shutdown);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
