//! Command dispatcher for sending commands to the paired drone

use std::sync::Arc;

use anyhow::Result;
use dronesec_shared::codec;
use dronesec_shared::events::{ChannelEvent, EventBus};
use dronesec_shared::protocol::{CommandTracker, PendingCommand, RetryPolicy};
use dronesec_shared::session::Session;
use dronesec_shared::topics;
use dronesec_shared::{Command, CommandAck, CommandType, Message};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Summary of one timeout check
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutReport {
    pub resent: usize,
    pub failed: usize,
}

/// Issues commands to the drone and tracks them until resolved
pub struct CommandDispatcher {
    session: Arc<Session>,
    drone_id: String,
    events: EventBus,
    tracker: Mutex<CommandTracker>,
}

impl CommandDispatcher {
    /// Create a new command dispatcher
    pub fn new(session: Arc<Session>, drone_id: String, policy: RetryPolicy, events: EventBus) -> Self {
        Self {
            session,
            drone_id,
            events,
            tracker: Mutex::new(CommandTracker::new(policy)),
        }
    }

    /// Send a new command to the drone and start tracking it. A command the
    /// session refuses is never tracked.
    pub async fn issue(&self, command_type: CommandType, payload: Vec<u8>, now_ms: u64) -> Result<PendingCommand> {
        let command = Command::new(command_type, self.drone_id.clone(), payload);
        // held across the send so an early ack waits for the entry
        let mut tracker = self.tracker.lock().await;
        self.send(&command)?;
        let pending = tracker.issue(command.clone(), now_ms);
        drop(tracker);

        info!(
            ">>> Sent command {} ({}) to {}",
            command.command_id, command.command_type, self.drone_id
        );
        Ok(pending)
    }

    /// Handle an ACK received from the drone
    pub async fn handle_ack(&self, ack: &CommandAck) -> Option<PendingCommand> {
        let resolved = self.tracker.lock().await.on_ack(ack)?;

        info!(
            "<<< ACK for command {} ({}): {} {}",
            ack.command_id, resolved.command.command_type, ack.outcome, ack.detail
        );
        self.events.publish(ChannelEvent::CommandResolved {
            command_id: ack.command_id,
            command_type: resolved.command.command_type,
            outcome: ack.outcome,
            detail: ack.detail.clone(),
        });
        Some(resolved)
    }

    /// Resend due commands and fail the ones out of attempts
    pub async fn check_timeouts(&self, now_ms: u64) -> TimeoutReport {
        let outcome = self.tracker.lock().await.tick(now_ms);

        for command in &outcome.resend {
            if let Err(e) = self.send(command) {
                warn!("Resend of {} failed: {}", command.command_id, e);
            }
        }
        for pending in &outcome.failed {
            warn!(
                "Command {} ({}) failed: no ack after {} attempt(s)",
                pending.command_id(),
                pending.command.command_type,
                pending.attempts
            );
            self.events.publish(ChannelEvent::DeliveryFailed {
                command_id: pending.command_id(),
                command_type: pending.command.command_type,
                attempts: pending.attempts,
            });
        }

        TimeoutReport {
            resent: outcome.resend.len(),
            failed: outcome.failed.len(),
        }
    }

    /// Get count of pending commands
    pub async fn pending_count(&self) -> usize {
        self.tracker.lock().await.pending_count()
    }

    fn send(&self, command: &Command) -> Result<()> {
        let message = Message::Command(command.clone());
        let payload = codec::encode(&message)?;
        let (topic, qos) = topics::outbound(&message, &self.drone_id);
        self.session.publish(&topic, payload, qos)?;
        Ok(())
    }
}
