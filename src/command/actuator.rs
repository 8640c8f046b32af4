//! Actuator seam between accepted commands and the flight hardware

use std::time::Duration;

use async_trait::async_trait;
use dronesec_shared::CommandType;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// A command the state machine has accepted for execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableCommand {
    pub command_id: Uuid,
    pub command_type: CommandType,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub detail: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("execution failed: {0}")]
    Failed(String),

    #[error("{0} is not supported by this actuator")]
    Unsupported(CommandType),

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),
}

/// Executes physical commands. Invoked at most once per command id.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn execute(&self, command: ExecutableCommand) -> Result<ExecutionOutcome, ExecutionError>;
}

/// Actuator for development: logs the command and reports success after a
/// short delay
#[derive(Debug, Clone)]
pub struct SimulatedActuator {
    delay: Duration,
}

impl SimulatedActuator {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for SimulatedActuator {
    fn default() -> Self {
        Self::new(Duration::from_millis(200))
    }
}

#[async_trait]
impl Actuator for SimulatedActuator {
    async fn execute(&self, command: ExecutableCommand) -> Result<ExecutionOutcome, ExecutionError> {
        info!(
            "[ACTUATOR] {} ({}) starting",
            command.command_type, command.command_id
        );
        tokio::time::sleep(self.delay).await;

        let detail = match command.command_type {
            CommandType::Land => "Landed at current position",
            CommandType::Abort => "Mission aborted, landed",
            CommandType::Halt => "Movement halted, holding position",
            CommandType::Proceed => "Movement resumed",
            other => {
                warn!("[ACTUATOR] {} has no physical action", other);
                return Err(ExecutionError::Unsupported(other));
            }
        };
        info!("[ACTUATOR] {} done: {}", command.command_type, detail);
        Ok(ExecutionOutcome {
            detail: detail.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_simulated_actuator() {
        let actuator = SimulatedActuator::default();
        let land = ExecutableCommand {
            command_id: Uuid::new_v4(),
            command_type: CommandType::Land,
            payload: Vec::new(),
        };
        assert!(actuator.execute(land).await.is_ok());

        let resume = ExecutableCommand {
            command_id: Uuid::new_v4(),
            command_type: CommandType::Resume,
            payload: Vec::new(),
        };
        assert_eq!(
            actuator.execute(resume).await,
            Err(ExecutionError::Unsupported(CommandType::Resume))
        );
    }
}
