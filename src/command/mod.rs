//! Command execution infrastructure for the drone
//!
//! This module handles:
//! - Deduplicating redelivered commands by id
//! - Gating commands through the security state machine
//! - Driving the actuator for physical commands
//! - Generating ACK responses

pub mod actuator;
mod executor;
pub mod handlers;

pub use actuator::{Actuator, ExecutableCommand, ExecutionError, ExecutionOutcome, SimulatedActuator};
pub use executor::{CommandExecutor, CommandResult, Execution};
