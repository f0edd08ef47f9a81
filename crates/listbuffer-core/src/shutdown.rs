//! Cancellation flag and the termination signal watcher.
//!
//! The flag is written once (by the watcher or a test) and read between
//! ticks. In-flight actions are never interrupted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::{Error, Result};

/// Longest single sleep while waiting, so a request is noticed promptly.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Shared shutdown request flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early once shutdown is requested.
    /// Returns `true` if shutdown was requested.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep((deadline - now).min(POLL_SLICE)).await;
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or, on unix, SIGTERM.
pub async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate())
            .map_err(|e| Error::Runtime(format!("SIGTERM handler failed: {e}")))?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.map_err(|e| Error::Runtime(format!("Ctrl+C handler failed: {e}")))?;
            }
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| Error::Runtime(format!("Ctrl+C handler failed: {e}")))?;
        Ok(())
    }
}

/// Spawn the watcher task that sets `signal` on termination.
///
/// If the handlers cannot be installed the flag is left alone and the
/// process keeps running until killed.
pub fn spawn_signal_watcher(signal: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                info!("Shutdown signal received, finishing current tick");
                signal.request();
            }
            Err(err) => warn!(error = %err, "Signal watcher failed"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let signal = ShutdownSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_requested());
        signal.request();
        assert!(observer.is_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_runs_full_duration_without_request() {
        let signal = ShutdownSignal::new();
        let start = Instant::now();
        assert!(!signal.sleep(Duration::from_millis(350)).await);
        assert!(start.elapsed() >= Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_wakes_early_on_request() {
        let signal = ShutdownSignal::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(150)).await;
            trigger.request();
        });

        let start = Instant::now();
        assert!(signal.sleep(Duration::from_secs(60)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn already_requested_returns_immediately() {
        let signal = ShutdownSignal::new();
        signal.request();
        assert!(signal.sleep(Duration::from_secs(60)).await);
    }
}
