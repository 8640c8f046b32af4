//! Operator side mirror of the paired drone's security state

use std::time::Duration;

use dronesec_shared::state_machine::{SecurityEvent, SecurityStateMachine, Transition, TransitionResult};
use dronesec_shared::{Role, SecurityMode, SecurityState, TelemetrySample};
use tracing::{debug, info, warn};

/// Mirrors states published by the drone and tracks its liveness
pub struct DroneMirror {
    drone_id: String,
    fsm: SecurityStateMachine,
    liveness_timeout_ms: u64,
    last_telemetry_ms: u64,
    /// Newest state received while OFFLINE
    held: Option<SecurityState>,
}

impl DroneMirror {
    /// The liveness clock starts now, as if a sample had just arrived
    pub fn new(drone_id: String, liveness_timeout: Duration, now_ms: u64) -> Self {
        Self {
            drone_id,
            fsm: SecurityStateMachine::new(Role::Operator, now_ms),
            liveness_timeout_ms: liveness_timeout.as_millis() as u64,
            last_telemetry_ms: now_ms,
            held: None,
        }
    }

    pub fn drone_id(&self) -> &str {
        &self.drone_id
    }

    pub fn state(&self) -> &SecurityState {
        self.fsm.state()
    }

    pub fn mode(&self) -> SecurityMode {
        self.fsm.mode()
    }

    /// Apply a state published by the drone. Stale states are ignored; while
    /// OFFLINE the newest one is held until telemetry shows the drone is back.
    pub fn on_state(&mut self, state: SecurityState) -> Option<Transition> {
        if self.fsm.mode() == SecurityMode::Offline {
            let newer = self.held.as_ref().map_or(true, |held| state.is_newer_than(held));
            if newer {
                debug!(
                    "{} is OFFLINE, holding state epoch={} seq={}",
                    self.drone_id, state.epoch, state.seq
                );
                self.held = Some(state);
            }
            return None;
        }

        let from = self.fsm.mode();
        let previous_epoch = self.fsm.state().epoch;
        let (epoch, seq) = (state.epoch, state.seq);
        if !self.fsm.mirror_state(state) {
            debug!(
                "Ignoring stale state {}/{} from {} (have {}/{})",
                epoch,
                seq,
                self.drone_id,
                self.fsm.state().epoch,
                self.fsm.state().seq
            );
            return None;
        }
        if previous_epoch != 0 && epoch != previous_epoch {
            info!("{} restarted, following new log from epoch {}", self.drone_id, epoch);
        }
        Some(Transition {
            from,
            to: self.fsm.state().clone(),
        })
    }

    /// Record a telemetry sample. Leaves OFFLINE into the sample's mode.
    pub fn on_telemetry(&mut self, sample: &TelemetrySample, now_ms: u64) -> Option<Transition> {
        self.last_telemetry_ms = now_ms;
        if self.fsm.mode() != SecurityMode::Offline {
            return None;
        }

        let event = SecurityEvent::TelemetryReceived { mode: sample.mode };
        match self.fsm.process_event(event, now_ms) {
            TransitionResult::Success(_) => {
                // A held state matching the sample carries the alert id and seq
                if let Some(held) = self.held.take() {
                    if held.mode == sample.mode {
                        self.fsm.mirror_state(held);
                    }
                }
                info!("{} back online in {}", self.drone_id, self.fsm.mode());
                Some(Transition {
                    from: SecurityMode::Offline,
                    to: self.fsm.state().clone(),
                })
            }
            TransitionResult::Invalid { from, event } => {
                warn!("Cannot leave {} on {:?}", from, event);
                None
            }
        }
    }

    /// Move to OFFLINE if no telemetry arrived within the liveness timeout
    pub fn check_liveness(&mut self, now_ms: u64) -> Option<Transition> {
        let silent_for = now_ms.saturating_sub(self.last_telemetry_ms);
        if silent_for < self.liveness_timeout_ms || self.fsm.mode() == SecurityMode::Offline {
            return None;
        }

        match self.fsm.process_event(SecurityEvent::LivenessTimeout, now_ms) {
            TransitionResult::Success(transition) => {
                warn!("{} silent for {}ms, marking OFFLINE", self.drone_id, silent_for);
                Some(transition)
            }
            TransitionResult::Invalid { .. } => None,
        }
    }
}
