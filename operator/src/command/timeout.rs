//! Timeout tracking for pending commands

use super::dispatcher::CommandDispatcher;
use dronesec_shared::now_ms;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

/// Periodically resends unacknowledged commands and fails exhausted ones
pub struct TimeoutTracker {
    dispatcher: Arc<CommandDispatcher>,
    check_interval: Duration,
}

impl TimeoutTracker {
    /// Create a new timeout tracker
    pub fn new(dispatcher: Arc<CommandDispatcher>, check_interval: Duration) -> Self {
        Self {
            dispatcher,
            check_interval,
        }
    }

    /// Run the timeout monitoring loop until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.dispatcher.check_timeouts(now_ms()).await;
                    if report.resent > 0 || report.failed > 0 {
                        debug!("Timeout check: {} resent, {} failed", report.resent, report.failed);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dronesec_shared::events::EventBus;
    use dronesec_shared::protocol::RetryPolicy;
    use dronesec_shared::session::memory::MemoryBroker;
    use dronesec_shared::session::{FingerprintPolicy, Session, SessionConfig};
    use dronesec_shared::{CommandType, DeviceIdentity, Role};

    #[tokio::test]
    async fn test_tracker_resends_until_failed() {
        let broker = MemoryBroker::new().unwrap();
        let (creds, fingerprint) = broker.issue_credentials("op-1").unwrap();
        let (session, _inbound) = Session::connect(
            broker.clone(),
            DeviceIdentity::new("op-1", Role::Operator, fingerprint),
            creds,
            &FingerprintPolicy,
            SessionConfig::default(),
            EventBus::new(),
        )
        .await
        .unwrap();
        let policy = RetryPolicy {
            ack_timeout: Duration::from_millis(30),
            max_interval: Duration::from_millis(30),
            max_attempts: 3,
        };
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::new(session),
            "drone-1".into(),
            policy,
            EventBus::new(),
        ));
        dispatcher.issue(CommandType::Halt, Vec::new(), now_ms()).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracker = TimeoutTracker::new(dispatcher.clone(), Duration::from_millis(10));
        let task = tokio::spawn(tracker.run(shutdown_rx));

        tokio::time::timeout(Duration::from_secs(2), async {
            while dispatcher.pending_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("command never failed");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.published_on("devices/drone-1/commands").len(), 3);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
