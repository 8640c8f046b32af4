//! Drone side of the security channel
//!
//! The agent loop owns the authoritative security state machine, evaluates
//! sensor readings against thresholds and executes operator commands.

pub mod agent;
pub mod command;
pub mod safety;
pub mod sensors;
