//! Drone agent
//!
//! One task owns the security state machine. It consumes commands from the
//! broker and readings from the local sensors in arrival order, publishes
//! telemetry, acks and every state transition.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dronesec_shared::codec;
use dronesec_shared::config::{Config, ThresholdConfig};
use dronesec_shared::events::{ChannelEvent, EventBus};
use dronesec_shared::session::{InboundMessage, QoS, Session};
use dronesec_shared::state_machine::{SecurityStateMachine, Transition, TransitionResult};
use dronesec_shared::topics::{self, TopicChannel, TopicRouter};
use dronesec_shared::{
    now_ms, Command, Message, MessageKind, Role, SecurityMode, StateReport, TelemetrySample,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::command::{Actuator, CommandExecutor, Execution};
use crate::safety::ThresholdMonitor;
use crate::sensors::Readings;

/// Agent settings taken from the `[drone]` and `[retry]` sections
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub device_id: String,
    pub thresholds: BTreeMap<String, ThresholdConfig>,
    pub recovery_window_ms: u64,
    pub execution_timeout: Duration,
    pub ack_cache_capacity: usize,
    /// How long computed acks stay cached, the operator's full retry span
    pub ack_retention: Duration,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let drone = config.drone()?;
        Ok(Self {
            device_id: config.identity.device_id.clone(),
            thresholds: drone.thresholds.clone(),
            recovery_window_ms: drone.recovery_window_ms,
            execution_timeout: Duration::from_millis(drone.execution_timeout_ms),
            ack_cache_capacity: config.retry.ack_cache_capacity,
            ack_retention: config.retry.policy().tracking_window(),
        })
    }
}

pub struct DroneAgent {
    device_id: String,
    session: Session,
    events: EventBus,
    fsm: SecurityStateMachine,
    monitor: ThresholdMonitor,
    executor: CommandExecutor,
    router: TopicRouter<TopicChannel>,
}

impl DroneAgent {
    pub fn new(settings: AgentSettings, session: Session, events: EventBus, actuator: Arc<dyn Actuator>) -> Self {
        let mut router = TopicRouter::new();
        for (topic, channel) in topics::subscriptions(Role::Drone, &settings.device_id, "") {
            router.register(&topic, channel);
        }

        Self {
            fsm: SecurityStateMachine::new(Role::Drone, now_ms()),
            monitor: ThresholdMonitor::new(settings.thresholds, settings.recovery_window_ms),
            executor: CommandExecutor::new(
                settings.device_id.clone(),
                actuator,
                settings.execution_timeout,
                settings.ack_cache_capacity,
                settings.ack_retention,
            ),
            device_id: settings.device_id,
            session,
            events,
            router,
        }
    }

    /// Run until shutdown is signalled or every input is closed
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut readings: mpsc::Receiver<Readings>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        for (topic, channel) in topics::subscriptions(Role::Drone, &self.device_id, "") {
            self.session.subscribe(&topic, channel.qos())?;
        }
        // Announce the initial state so a mirror can pick it up
        self.publish_state();
        info!("Drone agent {} running in {}", self.device_id, self.fsm.mode());

        let mut readings_open = true;
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

                sample = readings.recv(), if readings_open => match sample {
                    Some(sample) => self.handle_readings(sample),
                    None => {
                        warn!("Sensor source stopped");
                        readings_open = false;
                    }
                },
            }
        }

        self.session.disconnect().await;
        Ok(())
    }

    async fn handle_inbound(&mut self, message: InboundMessage) {
        let Some(channel) = self.router.route(&message.topic).copied() else {
            return;
        };
        if channel != TopicChannel::Commands {
            debug!("Ignoring {} message on {}", channel, message.topic);
            return;
        }

        let command = match codec::decode(&message.payload, MessageKind::Command) {
            Ok(Message::Command(command)) => command,
            Ok(other) => {
                warn!("Unexpected {} on {}", other.kind(), message.topic);
                return;
            }
            Err(e) => {
                warn!("Discarding malformed command on {}: {}", message.topic, e);
                return;
            }
        };
        if command.target_device_id != self.device_id {
            warn!(
                "Discarding command {} for {} received on {}",
                command.command_id, command.target_device_id, message.topic
            );
            return;
        }

        self.handle_command(command).await;
    }

    async fn handle_command(&mut self, command: Command) {
        let execution = self.executor.execute(&command, &mut self.fsm).await;
        let Execution {
            ack,
            command_type,
            transition,
            duplicate,
        } = execution;

        if let Some(transition) = transition {
            self.on_transition(transition);
        }
        self.publish(&Message::Ack(ack.clone()));

        if !duplicate {
            self.events.publish(ChannelEvent::CommandHandled {
                command_id: ack.command_id,
                command_type,
                outcome: ack.outcome,
                detail: ack.detail,
            });
        }
    }

    fn handle_readings(&mut self, readings: Readings) {
        for event in self.monitor.evaluate(&readings, self.fsm.mode(), now_ms()) {
            match self.fsm.process_event(event, now_ms()) {
                TransitionResult::Success(transition) => self.on_transition(transition),
                TransitionResult::Invalid { from, event } => {
                    debug!("Ignoring {:?} in {}", event, from);
                }
            }
        }

        let sample = TelemetrySample::new(self.device_id.clone(), readings, self.fsm.mode());
        self.events.publish(ChannelEvent::Telemetry(sample.clone()));
        self.publish(&Message::Telemetry(sample));
    }

    fn on_transition(&mut self, transition: Transition) {
        info!(
            "[STATE] {} -> {} (seq={}, alert={})",
            transition.from,
            transition.to.mode,
            transition.to.seq,
            transition.to.active_alert_id.as_deref().unwrap_or("-")
        );
        self.publish_state();
        self.events.publish(ChannelEvent::StateChanged {
            device_id: self.device_id.clone(),
            previous: transition.from,
            state: transition.to,
        });
    }

    fn publish_state(&self) {
        let report = StateReport {
            device_id: self.device_id.clone(),
            state: self.fsm.state().clone(),
        };
        self.publish(&Message::State(report));
    }

    fn publish(&self, message: &Message) {
        let payload = match codec::encode(message) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode {}: {}", message.kind(), e);
                return;
            }
        };
        let (topic, qos): (String, QoS) = topics::outbound(message, &self.device_id);
        if let Err(e) = self.session.publish(&topic, payload, qos) {
            warn!("Failed to publish {} on {}: {}", message.kind(), topic, e);
        }
    }
}
