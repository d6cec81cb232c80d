//! Liveness monitor: the server-side ping cycle.
//!
//! One monitor runs per connected client while `ping_interval` is
//! non-zero. Each cycle sleeps to the probe point, skips the probe when
//! data arrived since the last one (implicit liveness), otherwise
//! enqueues a `Ping` and gives the pong its budget. A missing pong ends
//! the monitor, and the session turns that into a `PingTimeout` fault.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::package::{Package, PackageType};
use crate::protocol::handler::PackageHandler;

/// Per-connection liveness flags, shared between the monitor and the
/// obtain path.
#[derive(Default)]
pub struct LivenessFlags {
    pong_ok: AtomicBool,
    data_seen: AtomicBool,
}

impl LivenessFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A pong arrived.
    pub fn mark_pong(&self) {
        self.pong_ok.store(true, Ordering::Release);
    }

    /// A data package arrived; counts as a pong and as implicit
    /// liveness for the next cycle.
    pub fn mark_data(&self) {
        self.pong_ok.store(true, Ordering::Release);
        self.data_seen.store(true, Ordering::Release);
    }

    fn take_data_seen(&self) -> bool {
        self.data_seen.swap(false, Ordering::AcqRel)
    }

    fn arm(&self) {
        self.pong_ok.store(false, Ordering::Release);
    }

    fn pong_ok(&self) -> bool {
        self.pong_ok.load(Ordering::Acquire)
    }
}

/// Why a monitor stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum MonitorExit {
    Cancelled,
    PongMissed,
}

/// Drive the ping cycle until cancellation or a missed pong.
///
/// Caller invariant: `ping_timeout < ping_interval`.
pub async fn monitor(
    handler: Arc<PackageHandler>,
    flags: Arc<LivenessFlags>,
    ping_interval: Duration,
    ping_timeout: Duration,
    cancel: CancellationToken,
) -> MonitorExit {
    let lead = ping_interval.saturating_sub(ping_timeout);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return MonitorExit::Cancelled,
            _ = tokio::time::sleep(lead) => {}
        }

        if flags.take_data_seen() {
            debug!("data since last probe, skipping ping cycle");
            continue;
        }

        flags.arm();
        if handler.send(Package::internal(PackageType::Ping)).is_err() {
            return MonitorExit::Cancelled;
        }

        tokio::select! {
            _ = cancel.cancelled() => return MonitorExit::Cancelled,
            _ = tokio::time::sleep(ping_timeout) => {}
        }

        if !flags.pong_ok() {
            warn!("no pong or data within the ping budget");
            return MonitorExit::PongMissed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stream::{PackageReader, PackageWriter};
    use crate::error::Fault;
    use crate::protocol::handler::PackageHooks;
    use async_trait::async_trait;

    struct Quiet;

    #[async_trait]
    impl PackageHooks for Quiet {
        async fn on_internal(&self, _pkg: Package) {}
        async fn on_data(&self, _pkg: Package) {}
        async fn on_error(&self, _fault: Fault) {}
    }

    fn handler_pair() -> (PackageHandler, PackageHandler) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        let timeout = Duration::from_millis(500);
        (
            PackageHandler::from_parts(
                PackageReader::new(left_read, timeout),
                PackageWriter::new(left_write),
            ),
            PackageHandler::from_parts(
                PackageReader::new(right_read, timeout),
                PackageWriter::new(right_write),
            ),
        )
    }

    #[tokio::test]
    async fn silent_peer_misses_the_pong() {
        let (local, _remote) = handler_pair();
        let local = Arc::new(local);
        local.start_all(Arc::new(Quiet));
        let flags = LivenessFlags::new();

        let exit = monitor(
            Arc::clone(&local),
            flags,
            Duration::from_millis(200),
            Duration::from_millis(100),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(exit, MonitorExit::PongMissed);
    }

    #[tokio::test]
    async fn pong_keeps_the_monitor_running() {
        let (local, _remote) = handler_pair();
        let local = Arc::new(local);
        local.start_all(Arc::new(Quiet));
        let flags = LivenessFlags::new();

        // Simulate pongs arriving from elsewhere.
        let pinger_flags = Arc::clone(&flags);
        let feeder = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(30)).await;
                pinger_flags.mark_pong();
            }
        });

        let cancel = CancellationToken::new();
        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            deadline.cancel();
        });

        let exit = monitor(
            Arc::clone(&local),
            flags,
            Duration::from_millis(200),
            Duration::from_millis(100),
            cancel,
        )
        .await;
        feeder.abort();
        assert_eq!(exit, MonitorExit::Cancelled);
    }

    #[tokio::test]
    async fn recent_data_skips_the_probe() {
        let (local, _remote) = handler_pair();
        let local = Arc::new(local);
        local.start_all(Arc::new(Quiet));
        let flags = LivenessFlags::new();

        let data_flags = Arc::clone(&flags);
        let feeder = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                data_flags.mark_data();
            }
        });

        let cancel = CancellationToken::new();
        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            deadline.cancel();
        });

        let exit = monitor(
            Arc::clone(&local),
            flags,
            Duration::from_millis(100),
            Duration::from_millis(50),
            cancel,
        )
        .await;
        feeder.abort();
        assert_eq!(exit, MonitorExit::Cancelled);
    }
}
