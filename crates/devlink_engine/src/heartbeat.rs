//! Heartbeat supervisor. Pings every session and evicts the silent ones.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::connection::ConnectionId;
use crate::events::{EngineEvent, EventBus};
use crate::message::Envelope;
use crate::session::SessionRegistry;

/// Result of one supervisor pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions removed for missing the heartbeat deadline.
    pub evicted: Vec<ConnectionId>,
    /// Sessions a heartbeat was queued for.
    pub pinged: usize,
}

/// Periodic liveness check over the session registry.
#[derive(Debug, Clone)]
pub struct HeartbeatSupervisor {
    registry: Arc<SessionRegistry>,
    bus: EventBus,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatSupervisor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        bus: EventBus,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            bus,
            interval,
            timeout,
        }
    }

    /// One pass: evict every session whose last heartbeat is older than the
    /// timeout, and queue a heartbeat on every other one.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();

        for session in self.registry.snapshot() {
            let id = session.connection_id.clone();
            if let Some(evicted) = self.registry.evict_if_stale(&id, self.timeout, now) {
                evicted.handle().close();
                self.bus.publish(EngineEvent::SessionEvicted {
                    connection_id: id.clone(),
                    identity: evicted.identity,
                });
                report.evicted.push(id);
                continue;
            }

            match session.handle().post(Envelope::heartbeat()) {
                Ok(()) => report.pinged += 1,
                // A full outbox means the peer is not draining; the timeout
                // will catch it if it stays that way.
                Err(e) => debug!(connection_id = %id, error = %e, "Heartbeat not queued"),
            }
        }

        if !report.evicted.is_empty() {
            info!(count = report.evicted.len(), "Evicted stale sessions");
        }
        report
    }

    /// Run [`sweep`](Self::sweep) every interval until `shutdown` turns true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                timeout_secs = self.timeout.as_secs(),
                "Heartbeat supervisor started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => break,
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
            debug!("Heartbeat supervisor stopped");
        })
    }
}

/// Resolves once the shutdown flag is set or its sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
