//! Command executor - deduplicates, gates and dispatches incoming commands

use std::sync::Arc;
use std::time::Duration;

use dronesec_shared::protocol::AckCache;
use dronesec_shared::state_machine::{SecurityStateMachine, Transition};
use dronesec_shared::{now_ms, Command, CommandAck, CommandType};
use tracing::{info, warn};

use super::actuator::Actuator;
use super::handlers::{self, HandlerContext, HandlerOutput};

/// Result of command execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Command accepted, its state transition applied
    Accepted { message: String },
    /// Actuator completed the command
    Executed { message: String },
    /// Command allowed but execution failed
    Failed { message: String },
    /// Command not valid in the current state
    Rejected { message: String },
}

/// Outcome of handling one delivery of a command
#[derive(Debug, Clone)]
pub struct Execution {
    pub ack: CommandAck,
    pub command_type: CommandType,
    /// State transition caused by the command, if any
    pub transition: Option<Transition>,
    /// The id was seen before; the cached ack is re-emitted, nothing ran
    pub duplicate: bool,
}

/// Executes commands received from the operator
///
/// Each command id runs at most once while its ack is cached. The cache
/// keeps acks for `ack_retention`, sized to the operator's retry span, so
/// every resend of a command is answered with the original ack.
pub struct CommandExecutor {
    device_id: String,
    actuator: Arc<dyn Actuator>,
    execution_timeout: Duration,
    acks: AckCache,
}

impl CommandExecutor {
    /// Create a new command executor
    pub fn new(
        device_id: String,
        actuator: Arc<dyn Actuator>,
        execution_timeout: Duration,
        ack_cache_capacity: usize,
        ack_retention: Duration,
    ) -> Self {
        Self {
            device_id,
            actuator,
            execution_timeout,
            acks: AckCache::new(ack_cache_capacity, ack_retention),
        }
    }

    /// Execute a command against the state machine and return its ack
    pub async fn execute(&mut self, command: &Command, fsm: &mut SecurityStateMachine) -> Execution {
        if let Some(cached) = self.acks.get(&command.command_id) {
            info!(
                "Duplicate command {} ({}), re-sending {} ack",
                command.command_id, command.command_type, cached.outcome
            );
            return Execution {
                ack: cached.clone(),
                command_type: command.command_type,
                transition: None,
                duplicate: true,
            };
        }

        info!(
            "Executing command: id={} type={} mode={}",
            command.command_id,
            command.command_type,
            fsm.mode()
        );

        let output = if command.target_device_id != self.device_id {
            HandlerOutput {
                result: CommandResult::Rejected {
                    message: format!("command addressed to {}", command.target_device_id),
                },
                transition: None,
            }
        } else {
            let ctx = HandlerContext {
                device_id: &self.device_id,
                actuator: self.actuator.as_ref(),
                execution_timeout: self.execution_timeout,
            };

            // Dispatch to appropriate handler
            match command.command_type {
                CommandType::Acknowledge => handlers::handle_acknowledge(&ctx, fsm, command),
                CommandType::Resume => handlers::handle_resume(&ctx, fsm, command),
                CommandType::Land | CommandType::Abort => handlers::handle_land(&ctx, fsm, command).await,
                CommandType::Halt | CommandType::Proceed => {
                    handlers::handle_movement(&ctx, fsm, command).await
                }
            }
        };

        // Convert result to ACK
        let id = command.command_id;
        let ack = match output.result {
            CommandResult::Accepted { message } => {
                info!("  Command accepted: {}", message);
                CommandAck::accepted(id, message)
            }
            CommandResult::Executed { message } => {
                info!("  Command executed: {}", message);
                CommandAck::executed(id, message)
            }
            CommandResult::Failed { message } => {
                warn!("  Command failed: {}", message);
                CommandAck::failed(id, message)
            }
            CommandResult::Rejected { message } => {
                warn!("  Command rejected: {}", message);
                CommandAck::rejected(id, message)
            }
        };
        self.acks.insert(ack.clone(), now_ms());

        Execution {
            ack,
            command_type: command.command_type,
            transition: output.transition,
            duplicate: false,
        }
    }
}
