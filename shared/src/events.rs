//! In-process event bus
//!
//! Delivery is synchronous on the publishing task and ordered per kind.
//! Handlers run inline, so they must not block; anything slow (persistence,
//! dashboards) should hand the event off to its own task.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{trace, warn};
use uuid::Uuid;

use crate::message::{AckOutcome, CommandType, SecurityMode, SecurityState, TelemetrySample};
use crate::session::SessionState;

/// Event kinds handlers can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChanged,
    Telemetry,
    CommandHandled,
    CommandResolved,
    DeliveryFailed,
    DroppedMessage,
    ConnectionChanged,
}

/// Events published on the bus
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Security state changed (drone transition or operator mirror update)
    StateChanged {
        device_id: String,
        previous: SecurityMode,
        state: SecurityState,
    },
    Telemetry(TelemetrySample),
    /// Drone side audit of a handled command
    CommandHandled {
        command_id: Uuid,
        command_type: CommandType,
        outcome: AckOutcome,
        detail: String,
    },
    /// Issuer side terminal ack
    CommandResolved {
        command_id: Uuid,
        command_type: CommandType,
        outcome: AckOutcome,
        detail: String,
    },
    /// Retry budget exhausted without an ack
    DeliveryFailed {
        command_id: Uuid,
        command_type: CommandType,
        attempts: u32,
    },
    /// Buffered publish evicted while disconnected
    DroppedMessage { topic: String },
    ConnectionChanged {
        device_id: String,
        state: SessionState,
    },
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::StateChanged { .. } => EventKind::StateChanged,
            ChannelEvent::Telemetry(_) => EventKind::Telemetry,
            ChannelEvent::CommandHandled { .. } => EventKind::CommandHandled,
            ChannelEvent::CommandResolved { .. } => EventKind::CommandResolved,
            ChannelEvent::DeliveryFailed { .. } => EventKind::DeliveryFailed,
            ChannelEvent::DroppedMessage { .. } => EventKind::DroppedMessage,
            ChannelEvent::ConnectionChanged { .. } => EventKind::ConnectionChanged,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Fan-out of channel events to registered handlers
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<HashMap<EventKind, Vec<EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind
    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        match self.handlers.write() {
            Ok(mut handlers) => handlers.entry(kind).or_default().push(Arc::new(handler)),
            Err(_) => warn!("Event bus lock poisoned, dropping {:?} subscription", kind),
        }
    }

    /// Deliver an event to every handler of its kind, in registration order
    pub fn publish(&self, event: ChannelEvent) {
        let kind = event.kind();
        // Snapshot so handlers may subscribe without deadlocking
        let handlers: Vec<EventHandler> = match self.handlers.read() {
            Ok(handlers) => handlers.get(&kind).cloned().unwrap_or_default(),
            Err(_) => {
                warn!("Event bus lock poisoned, dropping {:?} event", kind);
                return;
            }
        };
        trace!("Publishing {:?} to {} handler(s)", kind, handlers.len());
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .map(|h| h.get(&kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}
