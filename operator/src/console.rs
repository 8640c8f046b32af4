//! Operator reader loop
//!
//! Sole owner of the drone mirror. Consumes telemetry, state and acks from
//! the paired drone in arrival order and runs the liveness check between
//! messages.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dronesec_shared::codec;
use dronesec_shared::events::{ChannelEvent, EventBus};
use dronesec_shared::session::{InboundMessage, Session};
use dronesec_shared::state_machine::Transition;
use dronesec_shared::topics::{self, TopicChannel, TopicRouter};
use dronesec_shared::{now_ms, Message, Role, SecurityState};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::command::CommandDispatcher;
use crate::session::DroneMirror;

/// Never check liveness more often than this
const MIN_LIVENESS_CHECK: Duration = Duration::from_millis(10);

pub struct Console {
    session: Arc<Session>,
    dispatcher: Arc<CommandDispatcher>,
    events: EventBus,
    mirror: DroneMirror,
    router: TopicRouter<TopicChannel>,
    liveness_check: Duration,
    state_tx: watch::Sender<SecurityState>,
}

impl Console {
    pub fn new(
        session: Arc<Session>,
        dispatcher: Arc<CommandDispatcher>,
        events: EventBus,
        drone_id: String,
        liveness_timeout: Duration,
    ) -> Self {
        let mut router = TopicRouter::new();
        for (topic, channel) in topics::subscriptions(Role::Operator, &session.identity().device_id, &drone_id) {
            router.register(&topic, channel);
        }
        let mirror = DroneMirror::new(drone_id, liveness_timeout, now_ms());
        let (state_tx, _) = watch::channel(mirror.state().clone());

        Self {
            session,
            dispatcher,
            events,
            mirror,
            router,
            liveness_check: (liveness_timeout / 4).max(MIN_LIVENESS_CHECK),
            state_tx,
        }
    }

    /// Latest mirrored state, for status display
    pub fn watch_state(&self) -> watch::Receiver<SecurityState> {
        self.state_tx.subscribe()
    }

    /// Run until shutdown is signalled or the session closes
    pub async fn run(mut self, mut inbound: mpsc::Receiver<InboundMessage>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let drone_id = self.mirror.drone_id().to_string();
        for (topic, channel) in topics::subscriptions(Role::Operator, &self.session.identity().device_id, &drone_id) {
            self.session.subscribe(&topic, channel.qos())?;
        }
        info!("Operator console watching {}", drone_id);

        let mut liveness = interval(self.liveness_check);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested");
                        break;
                    }
                }

                message = inbound.recv() => match message {
                    Some(message) => self.handle_inbound(message).await,
                    None => {
                        error!("Session closed");
                        break;
                    }
                },

                _ = liveness.tick() => {
                    if let Some(transition) = self.mirror.check_liveness(now_ms()) {
                        self.on_transition(transition);
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_inbound(&mut self, message: InboundMessage) {
        let Some(channel) = self.router.route(&message.topic).copied() else {
            return;
        };

        let decoded = match codec::decode(&message.payload, channel.message_kind()) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Discarding malformed {} on {}: {}", channel, message.topic, e);
                return;
            }
        };

        match decoded {
            Message::Telemetry(sample) => {
                if sample.device_id != self.mirror.drone_id() {
                    warn!("Discarding telemetry from {} on {}", sample.device_id, message.topic);
                    return;
                }
                if let Some(transition) = self.mirror.on_telemetry(&sample, now_ms()) {
                    self.on_transition(transition);
                }
                self.events.publish(ChannelEvent::Telemetry(sample));
            }
            Message::State(report) => {
                if report.device_id != self.mirror.drone_id() {
                    warn!("Discarding state from {} on {}", report.device_id, message.topic);
                    return;
                }
                if let Some(transition) = self.mirror.on_state(report.state) {
                    self.on_transition(transition);
                }
            }
            Message::Ack(ack) => {
                self.dispatcher.handle_ack(&ack).await;
            }
            Message::Command(command) => {
                debug!("Ignoring command {} on {}", command.command_id, message.topic);
            }
        }
    }

    fn on_transition(&mut self, transition: Transition) {
        info!(
            "[MIRROR] {} {} -> {} (seq={}, alert={})",
            self.mirror.drone_id(),
            transition.from,
            transition.to.mode,
            transition.to.seq,
            transition.to.active_alert_id.as_deref().unwrap_or("-")
        );
        self.state_tx.send_replace(transition.to.clone());
        self.events.publish(ChannelEvent::StateChanged {
            device_id: self.mirror.drone_id().to_string(),
            previous: transition.from,
            state: transition.to,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::TimeoutTracker;
    use drone_agent::agent::{AgentSettings, DroneAgent};
    use drone_agent::command::{Actuator, ExecutableCommand, ExecutionError, ExecutionOutcome};
    use drone_agent::sensors::Readings;
    use dronesec_shared::events::EventKind;
    use dronesec_shared::protocol::RetryPolicy;
    use dronesec_shared::session::memory::MemoryBroker;
    use dronesec_shared::session::{FingerprintPolicy, SessionConfig};
    use dronesec_shared::{
        AckOutcome, CommandAck, CommandType, DeviceIdentity, SecurityMode, StateReport, TelemetrySample,
    };
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const BOOT: u64 = 1_700_000_000_000;

    struct Harness {
        drone: Session,
        dispatcher: Arc<CommandDispatcher>,
        state: watch::Receiver<SecurityState>,
        events: EventBus,
        shutdown: watch::Sender<bool>,
        console: JoinHandle<Result<()>>,
    }

    async fn connect(broker: &MemoryBroker, id: &str, role: Role, events: EventBus) -> (Session, mpsc::Receiver<InboundMessage>) {
        let (creds, fingerprint) = broker.issue_credentials(id).unwrap();
        Session::connect(
            broker.clone(),
            DeviceIdentity::new(id, role, fingerprint),
            creds,
            &FingerprintPolicy,
            SessionConfig::default(),
            events,
        )
        .await
        .unwrap()
    }

    async fn start(liveness_timeout: Duration) -> Harness {
        let broker = MemoryBroker::new().unwrap();
        let events = EventBus::new();
        let (operator, inbound) = connect(&broker, "op-1", Role::Operator, events.clone()).await;
        let operator = Arc::new(operator);
        let dispatcher = Arc::new(CommandDispatcher::new(
            operator.clone(),
            "drone-1".into(),
            RetryPolicy::default(),
            events.clone(),
        ));
        let console = Console::new(
            operator,
            dispatcher.clone(),
            events.clone(),
            "drone-1".into(),
            liveness_timeout,
        );
        let state = console.watch_state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let console = tokio::spawn(console.run(inbound, shutdown_rx));
        // let the subscriptions land
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (drone, _drone_rx) = connect(&broker, "drone-1", Role::Drone, EventBus::new()).await;
        Harness {
            drone,
            dispatcher,
            state,
            events,
            shutdown: shutdown_tx,
            console,
        }
    }

    impl Harness {
        fn publish(&self, message: Message) {
            let payload = codec::encode(&message).unwrap();
            let (topic, qos) = topics::outbound(&message, "drone-1");
            self.drone.publish(&topic, payload, qos).unwrap();
        }

        fn report(&self, mode: SecurityMode, seq: u64) {
            self.publish(Message::State(StateReport {
                device_id: "drone-1".into(),
                state: SecurityState {
                    mode,
                    active_alert_id: None,
                    entered_at_ms: now_ms(),
                    epoch: BOOT,
                    seq,
                },
            }));
        }

        fn telemetry(&self, device_id: &str, mode: SecurityMode) {
            let mut readings = BTreeMap::new();
            readings.insert("temperature".to_string(), 40.0);
            self.publish(Message::Telemetry(TelemetrySample::new(device_id, readings, mode)));
        }

        async fn wait_for_mode(&mut self, mode: SecurityMode) {
            timeout(Duration::from_secs(2), self.state.wait_for(|s| s.mode == mode))
                .await
                .expect("timed out waiting for mode")
                .unwrap();
        }

        async fn stop(self) {
            self.shutdown.send(true).unwrap();
            self.console.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_state_mirrored_and_stale_ignored() {
        let mut h = start(Duration::from_secs(10)).await;
        let changes = Arc::new(StdMutex::new(Vec::new()));
        let sink = changes.clone();
        h.events.subscribe(EventKind::StateChanged, move |e| sink.lock().unwrap().push(e.clone()));

        h.report(SecurityMode::Warning, 1);
        h.report(SecurityMode::Alert, 2);
        h.wait_for_mode(SecurityMode::Alert).await;
        h.report(SecurityMode::Warning, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.state.borrow().mode, SecurityMode::Alert);
        assert_eq!(changes.lock().unwrap().len(), 2);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_offline_then_restored_by_telemetry() {
        let mut h = start(Duration::from_millis(200)).await;
        h.report(SecurityMode::Warning, 1);
        h.wait_for_mode(SecurityMode::Warning).await;

        h.wait_for_mode(SecurityMode::Offline).await;

        // telemetry from another drone does not count
        h.telemetry("drone-2", SecurityMode::Normal);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.state.borrow().mode, SecurityMode::Offline);

        h.telemetry("drone-1", SecurityMode::Alert);
        h.wait_for_mode(SecurityMode::Alert).await;
        h.stop().await;
    }

    #[tokio::test]
    async fn test_ack_resolves_issued_command() {
        let h = start(Duration::from_secs(10)).await;
        let resolved = Arc::new(StdMutex::new(Vec::new()));
        let sink = resolved.clone();
        h.events.subscribe(EventKind::CommandResolved, move |e| sink.lock().unwrap().push(e.clone()));

        let pending = h
            .dispatcher
            .issue(CommandType::Acknowledge, Vec::new(), now_ms())
            .await
            .unwrap();
        h.publish(Message::Ack(CommandAck::rejected(pending.command_id(), "not valid in NORMAL")));

        timeout(Duration::from_secs(2), async {
            while h.dispatcher.pending_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("ack never resolved the command");

        let resolved = resolved.lock().unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(matches!(
            resolved[0],
            ChannelEvent::CommandResolved {
                outcome: AckOutcome::Rejected,
                ..
            }
        ));
        drop(resolved);
        h.stop().await;
    }

    #[derive(Default)]
    struct CountingActuator {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Actuator for CountingActuator {
        async fn execute(&self, command: ExecutableCommand) -> Result<ExecutionOutcome, ExecutionError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(ExecutionOutcome {
                detail: format!("{} done", command.command_type),
            })
        }
    }

    #[tokio::test]
    async fn test_lost_ack_recovered_by_resend_without_reexecution() {
        let broker = MemoryBroker::new().unwrap();
        let events = EventBus::new();
        let resolved = Arc::new(StdMutex::new(Vec::new()));
        let failed = Arc::new(StdMutex::new(Vec::new()));
        let sink = resolved.clone();
        events.subscribe(EventKind::CommandResolved, move |e| sink.lock().unwrap().push(e.clone()));
        let sink = failed.clone();
        events.subscribe(EventKind::DeliveryFailed, move |e| sink.lock().unwrap().push(e.clone()));

        // operator: console, dispatcher and retry ticker
        let (operator, inbound) = connect(&broker, "op-1", Role::Operator, events.clone()).await;
        let operator = Arc::new(operator);
        let policy = RetryPolicy {
            ack_timeout: Duration::from_millis(150),
            max_interval: Duration::from_millis(300),
            max_attempts: 4,
        };
        let dispatcher = Arc::new(CommandDispatcher::new(
            operator.clone(),
            "drone-1".into(),
            policy,
            events.clone(),
        ));
        let console = Console::new(
            operator,
            dispatcher.clone(),
            events.clone(),
            "drone-1".into(),
            Duration::from_secs(10),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let console = tokio::spawn(console.run(inbound, shutdown_rx.clone()));
        let ticker = TimeoutTracker::new(dispatcher.clone(), Duration::from_millis(20));
        let ticker = tokio::spawn(ticker.run(shutdown_rx.clone()));

        // drone: the real agent
        let (drone, drone_rx) = connect(&broker, "drone-1", Role::Drone, EventBus::new()).await;
        let settings = AgentSettings {
            device_id: "drone-1".into(),
            thresholds: BTreeMap::new(),
            recovery_window_ms: 60_000,
            execution_timeout: Duration::from_secs(1),
            ack_cache_capacity: 16,
            ack_retention: policy.tracking_window(),
        };
        let actuator = Arc::new(CountingActuator::default());
        let agent = DroneAgent::new(settings, drone, EventBus::new(), actuator.clone());
        let (_readings_tx, readings_rx) = mpsc::channel::<Readings>(8);
        let agent = tokio::spawn(agent.run(drone_rx, readings_rx, shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        broker.drop_next("devices/drone-1/acks", 1);
        dispatcher.issue(CommandType::Halt, Vec::new(), now_ms()).await.unwrap();

        timeout(Duration::from_secs(3), async {
            while dispatcher.pending_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("resend never resolved the command");
        // outlast the whole retry budget
        tokio::time::sleep(policy.tracking_window()).await;

        assert_eq!(actuator.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(broker.published_on("devices/drone-1/commands").len() >= 2);
        // the dropped ack and the cached one replayed for the resend
        assert!(broker.published_on("devices/drone-1/acks").len() >= 2);
        {
            let resolved = resolved.lock().unwrap();
            assert_eq!(resolved.len(), 1);
            assert!(matches!(
                resolved[0],
                ChannelEvent::CommandResolved {
                    command_type: CommandType::Halt,
                    outcome: AckOutcome::Executed,
                    ..
                }
            ));
        }
        assert!(failed.lock().unwrap().is_empty());

        shutdown_tx.send(true).unwrap();
        console.await.unwrap().unwrap();
        ticker.await.unwrap();
        agent.await.unwrap().unwrap();
    }
}
