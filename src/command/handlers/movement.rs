//! HALT / PROCEED command handler

use dronesec_shared::state_machine::SecurityStateMachine;
use dronesec_shared::{Command, SecurityMode};
use tracing::{info, warn};

use super::{actuate, HandlerContext, HandlerOutput};
use crate::command::CommandResult;

/// Handle HALT and PROCEED
///
/// Movement control does not change the security mode. It is refused while
/// the drone is grounded in MAINTENANCE.
pub async fn handle_movement(
    ctx: &HandlerContext<'_>,
    fsm: &SecurityStateMachine,
    command: &Command,
) -> HandlerOutput {
    if fsm.mode() == SecurityMode::Maintenance {
        return HandlerOutput::rejected(format!(
            "{} not valid in {}, drone is grounded",
            command.command_type,
            fsm.mode()
        ));
    }

    info!("[{}] {}", command.command_type, ctx.device_id);
    let result = match actuate(ctx, command).await {
        Ok(outcome) => CommandResult::Executed {
            message: outcome.detail,
        },
        Err(e) => {
            warn!("[{}] {} failed: {}", command.command_type, command.command_id, e);
            CommandResult::Failed {
                message: e.to_string(),
            }
        }
    };
    HandlerOutput::without_transition(result)
}
