//! ACKNOWLEDGE command handler

use dronesec_shared::state_machine::{SecurityEvent, SecurityStateMachine};
use dronesec_shared::Command;
use tracing::info;

use super::{apply_accepted, HandlerContext, HandlerOutput};

/// Handle ACKNOWLEDGE: the operator has seen the alert, ALERT drops back to
/// WARNING with the alert still open
pub fn handle_acknowledge(
    ctx: &HandlerContext<'_>,
    fsm: &mut SecurityStateMachine,
    command: &Command,
) -> HandlerOutput {
    let alert = fsm.state().active_alert_id.clone();
    let output = apply_accepted(fsm, SecurityEvent::AlertAcknowledged, command, "Alert acknowledged");
    if output.transition.is_some() {
        info!(
            "[ACKNOWLEDGE] {} alert {} acknowledged by operator",
            ctx.device_id,
            alert.as_deref().unwrap_or("-")
        );
    }
    output
}
