//! Active liveness checks for agent sessions
//!
//! Sessions that go quiet are pinged once per interval and evicted after
//! `max_missed` intervals without any inbound traffic.

use backhaul_proto::TunnelMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::SessionRegistry;
use crate::session::WRITE_TIMEOUT;

/// Shortest sweep period and ping write bound
const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    pub interval: Duration,
    pub max_missed: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_missed: 3,
        }
    }
}

impl LivenessConfig {
    /// Idle time after which a session is evicted
    pub fn eviction_after(&self) -> Duration {
        self.interval * self.max_missed.max(1)
    }
}

/// Outcome of one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub evicted: usize,
}

pub struct LivenessMonitor {
    registry: Arc<SessionRegistry>,
    config: LivenessConfig,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<SessionRegistry>, config: LivenessConfig) -> Self {
        Self { registry, config }
    }

    /// Sweep every interval until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        // `interval` panics on a zero period
        let period = if self.config.interval.is_zero() {
            warn!("Liveness interval is zero, using {:?}", MIN_INTERVAL);
            MIN_INTERVAL
        } else {
            self.config.interval
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Liveness monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if report.evicted > 0 {
                        warn!(evicted = report.evicted, "Evicted unresponsive sessions");
                    }
                }
            }
        }
    }

    /// Check every session once. Sessions are checked concurrently and each
    /// write is bounded, so one stuck connection cannot stall the others.
    pub async fn sweep(&self) -> SweepReport {
        let evict_after = self.config.eviction_after();
        let ping_after = self.config.interval;
        let write_limit = self.config.interval.clamp(MIN_INTERVAL, WRITE_TIMEOUT);

        let mut checks = JoinSet::new();
        for session in self.registry.snapshot() {
            let registry = Arc::clone(&self.registry);
            checks.spawn(async move {
                let idle = session.idle_for();

                if idle >= evict_after {
                    warn!(
                        session_id = %session.id(),
                        idle_secs = idle.as_secs(),
                        "Evicting unresponsive session"
                    );
                    registry.unregister(session.id());
                    session.close().await;
                    return Check::Evicted;
                }
                if idle < ping_after {
                    return Check::Idle;
                }

                let ping = TunnelMessage::Ping {
                    id: format!("ping_{}", uuid::Uuid::new_v4().simple()),
                };
                match session.send_within(&ping, write_limit).await {
                    Ok(()) => Check::Pinged,
                    Err(e) => {
                        warn!(session_id = %session.id(), "Ping failed, closing session: {}", e);
                        registry.unregister(session.id());
                        session.close().await;
                        Check::Evicted
                    }
                }
            });
        }

        let mut report = SweepReport::default();
        while let Some(check) = checks.join_next().await {
            match check {
                Ok(Check::Pinged) => report.pinged += 1,
                Ok(Check::Evicted) => report.evicted += 1,
                Ok(Check::Idle) => {}
                Err(e) => warn!("Liveness check failed: {}", e),
            }
        }
        report
    }
}

enum Check {
    Idle,
    Pinged,
    Evicted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::testing::StalledSender;
    use backhaul_proto::LocalTarget;
    use backhaul_transport::{memory, MessageReceiver};

    fn config() -> LivenessConfig {
        LivenessConfig {
            interval: Duration::from_secs(10),
            max_missed: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_session_left_alone() {
        let registry = Arc::new(SessionRegistry::new());
        let (a, _b) = memory::pair();
        registry
            .register(Arc::new(Session::new(LocalTarget::default(), a.sender)))
            .unwrap();

        let monitor = LivenessMonitor::new(Arc::clone(&registry), config());
        assert_eq!(monitor.sweep().await, SweepReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_pinged_then_evicted() {
        let registry = Arc::new(SessionRegistry::new());
        let (a, mut agent) = memory::pair();
        let session = Arc::new(Session::new(LocalTarget::default(), a.sender));
        registry.register(Arc::clone(&session)).unwrap();
        let monitor = LivenessMonitor::new(Arc::clone(&registry), config());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            monitor.sweep().await,
            SweepReport {
                pinged: 1,
                evicted: 0
            }
        );
        assert!(matches!(
            agent.receiver.recv().await.unwrap(),
            Some(TunnelMessage::Ping { .. })
        ));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(monitor.sweep().await.evicted, 1);
        assert_eq!(registry.count(), 0);
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_keeps_session_alive() {
        let registry = Arc::new(SessionRegistry::new());
        let (a, _b) = memory::pair();
        let session = Arc::new(Session::new(LocalTarget::default(), a.sender));
        registry.register(Arc::clone(&session)).unwrap();
        let monitor = LivenessMonitor::new(Arc::clone(&registry), config());

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(9)).await;
            session.touch();
            assert_eq!(monitor.sweep().await, SweepReport::default());
        }
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_session_does_not_block_sweep() {
        let registry = Arc::new(SessionRegistry::new());
        let stalled = Arc::new(Session::new(LocalTarget::default(), Arc::new(StalledSender)));
        registry.register(Arc::clone(&stalled)).unwrap();
        let (a, mut agent) = memory::pair();
        let healthy = Arc::new(Session::new(LocalTarget::default(), a.sender));
        registry.register(Arc::clone(&healthy)).unwrap();
        let monitor = LivenessMonitor::new(Arc::clone(&registry), config());

        tokio::time::advance(Duration::from_secs(11)).await;
        let report = tokio::time::timeout(Duration::from_secs(600), monitor.sweep())
            .await
            .expect("sweep must finish despite a stalled session");

        assert_eq!(
            report,
            SweepReport {
                pinged: 1,
                evicted: 1
            }
        );
        assert!(stalled.is_closed());
        assert_eq!(registry.ids(), [healthy.id().to_string()]);
        assert!(matches!(
            agent.receiver.recv().await.unwrap(),
            Some(TunnelMessage::Ping { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_does_not_panic() {
        let registry = Arc::new(SessionRegistry::new());
        let monitor = LivenessMonitor::new(
            registry,
            LivenessConfig {
                interval: Duration::ZERO,
                max_missed: 3,
            },
        );
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(monitor.run(shutdown.clone()));
        tokio::time::advance(Duration::from_secs(5)).await;
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let registry = Arc::new(SessionRegistry::new());
        let monitor = LivenessMonitor::new(registry, config());
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(monitor.run(shutdown.clone()));
        tokio::time::advance(Duration::from_secs(25)).await;
        shutdown.cancel();
        task.await.unwrap();
    }
}
