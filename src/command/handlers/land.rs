//! LAND / ABORT command handler

use dronesec_shared::state_machine::{SecurityEvent, SecurityStateMachine, TransitionResult};
use dronesec_shared::{now_ms, Command};
use tracing::{error, warn};

use super::{actuate, gate, HandlerContext, HandlerOutput};
use crate::command::CommandResult;

/// Handle LAND and ABORT
///
/// Only valid while in ALERT. The drone enters MAINTENANCE once the actuator
/// reports the landing done; a failed landing leaves the mode unchanged.
pub async fn handle_land(
    ctx: &HandlerContext<'_>,
    fsm: &mut SecurityStateMachine,
    command: &Command,
) -> HandlerOutput {
    if let Some(rejection) = gate(fsm, &SecurityEvent::ForcedLanding, command) {
        return rejection;
    }

    warn!("[{}] {} forced landing ordered", command.command_type, ctx.device_id);

    let outcome = match actuate(ctx, command).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("[{}] {} failed: {}", command.command_type, command.command_id, e);
            return HandlerOutput::without_transition(CommandResult::Failed {
                message: e.to_string(),
            });
        }
    };

    match fsm.process_event(SecurityEvent::ForcedLanding, now_ms()) {
        TransitionResult::Success(transition) => HandlerOutput {
            result: CommandResult::Executed {
                message: outcome.detail,
            },
            transition: Some(transition),
        },
        TransitionResult::Invalid { from, .. } => HandlerOutput::without_transition(CommandResult::Failed {
            message: format!("landed but mode changed to {from} meanwhile"),
        }),
    }
}
