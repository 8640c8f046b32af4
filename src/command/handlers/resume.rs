//! RESUME command handler

use dronesec_shared::state_machine::{SecurityEvent, SecurityStateMachine};
use dronesec_shared::Command;
use tracing::info;

use super::{apply_accepted, HandlerContext, HandlerOutput};

/// Handle RESUME: maintenance is over, back to NORMAL and the alert is closed
pub fn handle_resume(
    ctx: &HandlerContext<'_>,
    fsm: &mut SecurityStateMachine,
    command: &Command,
) -> HandlerOutput {
    let output = apply_accepted(fsm, SecurityEvent::MaintenanceResumed, command, "Resumed normal operation");
    if output.transition.is_some() {
        info!("[RESUME] {} back in service", ctx.device_id);
    }
    output
}
