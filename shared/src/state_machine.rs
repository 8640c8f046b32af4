//! Security State Machine
//!
//! Defines the valid security mode transitions. The drone owns the
//! authoritative machine; the operator keeps a mirror that may only move
//! into and out of the synthetic OFFLINE mode on its own.

use crate::message::{Role, SecurityMode, SecurityState};

/// Events that can trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum SecurityEvent {
    /// A reading crossed its soft threshold; opens a new alert
    SoftThresholdBreached { alert_id: String },
    /// A reading crossed its hard threshold
    HardThresholdBreached,
    /// All readings stayed within soft thresholds for the recovery window
    ReadingsRecovered,
    /// Operator ACKNOWLEDGE accepted
    AlertAcknowledged,
    /// Operator ABORT or LAND executed by the actuator
    ForcedLanding,
    /// Operator RESUME accepted
    MaintenanceResumed,
    /// No telemetry within the liveness timeout (operator only)
    LivenessTimeout,
    /// Telemetry arrived while OFFLINE (operator only)
    TelemetryReceived { mode: SecurityMode },
}

/// A successful transition
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: SecurityMode,
    pub to: SecurityState,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(Transition),
    /// Transition was invalid from current state
    Invalid {
        from: SecurityMode,
        event: SecurityEvent,
    },
}

impl TransitionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TransitionResult::Success(_))
    }
}

/// The security state machine for one drone
#[derive(Debug, Clone)]
pub struct SecurityStateMachine {
    role: Role,
    current: SecurityState,
}

impl SecurityStateMachine {
    /// Create a new state machine in NORMAL. A drone machine opens a new log
    /// epoch at `now_ms`; an operator machine has mirrored nothing yet and
    /// sits at epoch 0.
    pub fn new(role: Role, now_ms: u64) -> Self {
        let mut current = SecurityState::initial(now_ms);
        if role == Role::Operator {
            current.epoch = 0;
        }
        Self { role, current }
    }

    /// Get current state
    pub fn state(&self) -> &SecurityState {
        &self.current
    }

    /// Get current mode
    pub fn mode(&self) -> SecurityMode {
        self.current.mode
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Check whether an event would be accepted without applying it
    pub fn can_apply(&self, event: &SecurityEvent) -> bool {
        next_mode(self.role, self.current.mode, event).is_some()
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: SecurityEvent, now_ms: u64) -> TransitionResult {
        let from = self.current.mode;
        let to = match next_mode(self.role, from, &event) {
            Some(mode) => mode,
            None => return TransitionResult::Invalid { from, event },
        };

        let active_alert_id = match &event {
            SecurityEvent::SoftThresholdBreached { alert_id } => Some(alert_id.clone()),
            SecurityEvent::ReadingsRecovered | SecurityEvent::MaintenanceResumed => None,
            _ => self.current.active_alert_id.clone(),
        };

        // Only the drone extends the replicated transition log. The operator
        // keeps the epoch and sequence of the last drone state it mirrored.
        let seq = match self.role {
            Role::Drone => self.current.seq + 1,
            Role::Operator => self.current.seq,
        };

        self.current = SecurityState {
            mode: to,
            active_alert_id,
            entered_at_ms: now_ms,
            epoch: self.current.epoch,
            seq,
        };

        TransitionResult::Success(Transition {
            from,
            to: self.current.clone(),
        })
    }

    /// Operator side: take over a state published by the drone. Returns false
    /// for drone machines and for states not newer than the last one mirrored.
    /// Any state from a later epoch is newer, whatever its sequence.
    pub fn mirror_state(&mut self, state: SecurityState) -> bool {
        if self.role != Role::Operator || state.mode == SecurityMode::Offline {
            return false;
        }
        if !state.is_newer_than(&self.current) {
            return false;
        }
        self.current = state;
        true
    }
}

/// Get the next mode for a given event, if the transition is valid
fn next_mode(role: Role, from: SecurityMode, event: &SecurityEvent) -> Option<SecurityMode> {
    use SecurityEvent::*;
    use SecurityMode::*;

    match (role, from, event) {
        // Drone-authoritative table
        (Role::Drone, Normal, SoftThresholdBreached { .. }) => Some(Warning),
        (Role::Drone, Warning, HardThresholdBreached) => Some(Alert),
        (Role::Drone, Warning, ReadingsRecovered) => Some(Normal),
        (Role::Drone, Alert, AlertAcknowledged) => Some(Warning),
        (Role::Drone, Alert, ForcedLanding) => Some(Maintenance),
        (Role::Drone, Maintenance, MaintenanceResumed) => Some(Normal),

        // Operator mirror may only enter and leave OFFLINE
        (Role::Operator, Offline, LivenessTimeout) => None,
        (Role::Operator, _, LivenessTimeout) => Some(Offline),
        (Role::Operator, Offline, TelemetryReceived { mode }) if *mode != Offline => Some(*mode),

        // Invalid transition
        _ => None,
    }
}

/// Check if a mode change is permitted by the transition table
pub fn is_valid_transition(role: Role, from: SecurityMode, to: SecurityMode) -> bool {
    use SecurityMode::*;

    match role {
        Role::Drone => matches!(
            (from, to),
            (Normal, Warning)
                | (Warning, Alert)
                | (Warning, Normal)
                | (Alert, Warning)
                | (Alert, Maintenance)
                | (Maintenance, Normal)
        ),
        Role::Operator => match (from, to) {
            (Offline, Offline) => false,
            (_, Offline) => true,
            (Offline, _) => true,
            _ => false,
        },
    }
}
