//! Command handlers for different command types

mod acknowledge;
mod land;
mod movement;
mod resume;

pub use acknowledge::handle_acknowledge;
pub use land::handle_land;
pub use movement::handle_movement;
pub use resume::handle_resume;

use std::time::Duration;

use dronesec_shared::state_machine::{SecurityEvent, SecurityStateMachine, Transition, TransitionResult};
use dronesec_shared::{now_ms, Command};
use tokio::time::timeout;

use super::actuator::{Actuator, ExecutableCommand, ExecutionError, ExecutionOutcome};
use super::CommandResult;

/// Context passed to command handlers
pub struct HandlerContext<'a> {
    pub device_id: &'a str,
    pub actuator: &'a dyn Actuator,
    pub execution_timeout: Duration,
}

/// What a handler decided, plus the transition it applied if any
#[derive(Debug, Clone)]
pub struct HandlerOutput {
    pub result: CommandResult,
    pub transition: Option<Transition>,
}

impl HandlerOutput {
    fn without_transition(result: CommandResult) -> Self {
        Self {
            result,
            transition: None,
        }
    }

    fn rejected(message: impl Into<String>) -> Self {
        Self::without_transition(CommandResult::Rejected {
            message: message.into(),
        })
    }
}

/// Reject `command` unless the state machine accepts `event` in the current mode
fn gate(fsm: &SecurityStateMachine, event: &SecurityEvent, command: &Command) -> Option<HandlerOutput> {
    if fsm.can_apply(event) {
        None
    } else {
        Some(HandlerOutput::rejected(format!(
            "{} not valid in {}",
            command.command_type,
            fsm.mode()
        )))
    }
}

/// Apply a gated event for a command that has no physical action
fn apply_accepted(
    fsm: &mut SecurityStateMachine,
    event: SecurityEvent,
    command: &Command,
    message: &str,
) -> HandlerOutput {
    if let Some(rejection) = gate(fsm, &event, command) {
        return rejection;
    }
    match fsm.process_event(event, now_ms()) {
        TransitionResult::Success(transition) => HandlerOutput {
            result: CommandResult::Accepted {
                message: message.to_string(),
            },
            transition: Some(transition),
        },
        TransitionResult::Invalid { from, .. } => {
            HandlerOutput::rejected(format!("{} not valid in {}", command.command_type, from))
        }
    }
}

/// Run the actuator, bounded by the execution timeout
async fn actuate(ctx: &HandlerContext<'_>, command: &Command) -> Result<ExecutionOutcome, ExecutionError> {
    let executable = ExecutableCommand {
        command_id: command.command_id,
        command_type: command.command_type,
        payload: command.payload.clone(),
    };
    match timeout(ctx.execution_timeout, ctx.actuator.execute(executable)).await {
        Ok(result) => result,
        Err(_) => Err(ExecutionError::Timeout(ctx.execution_timeout)),
    }
}
