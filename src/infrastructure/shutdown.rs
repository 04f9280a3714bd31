//! Graceful Shutdown Handler
//!
//! One controller is shared by the listeners, event loops, resolver and
//! cluster roles. Listeners stop accepting once it fires; live bridges hold
//! a guard so the composition root can wait for them to drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Shutdown coordinator.
#[derive(Clone)]
pub struct ShutdownController {
    active_bridges: Arc<AtomicUsize>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    drained: Arc<Notify>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            active_bridges: Arc::new(AtomicUsize::new(0)),
            shutdown_tx: Arc::new(shutdown_tx),
            drained: Arc::new(Notify::new()),
        }
    }

    /// Receiver that flips to `true` on shutdown. Late subscribers see it too.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate shutdown. Idempotent.
    pub fn shutdown(&self) {
        let first = self.shutdown_tx.send_if_modified(|stopped| {
            let changed = !*stopped;
            *stopped = true;
            changed
        });
        if first {
            tracing::info!("initiating graceful shutdown");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn active_bridges(&self) -> usize {
        self.active_bridges.load(Ordering::SeqCst)
    }

    /// Track a bridge until the returned guard is dropped.
    pub fn bridge_guard(&self) -> BridgeGuard {
        self.active_bridges.fetch_add(1, Ordering::SeqCst);
        BridgeGuard {
            controller: self.clone(),
        }
    }

    fn bridge_ended(&self) {
        if self.active_bridges.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Wait until no bridge is active, or `timeout` elapses.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                if self.active_bridges() == 0 {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    "drain timeout: {} bridges still active",
                    self.active_bridges()
                );
                false
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts one live bridge while held.
pub struct BridgeGuard {
    controller: ShutdownController,
}

impl Drop for BridgeGuard {
    fn drop(&mut self) {
        self.controller.bridge_ended();
    }
}

/// Wait for Ctrl-C or SIGTERM, then fire the controller.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn shutdown_signal(controller: ShutdownController) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }

    controller.shutdown();
}
