//! Drone Security Channel - Shared Core
//!
//! This crate provides the pieces both ends of the channel are built from:
//! wire types and codec, the security state machine, topic routing, the
//! command/ack protocol, the in-process event bus and the broker session.

pub mod codec;
pub mod config;
pub mod events;
pub mod message;
pub mod proto;
pub mod protocol;
pub mod session;
pub mod state_machine;
pub mod topics;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use message::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Channel defaults. Sensor thresholds and the liveness timeout are
/// deployment specific and have no default.
pub mod defaults {
    /// Delay before the first resend of an unacknowledged command
    pub const COMMAND_ACK_TIMEOUT_MS: u64 = 3000;

    /// Upper bound on the interval between two resends
    pub const COMMAND_MAX_RETRY_INTERVAL_MS: u64 = 30000;

    /// Total sends of a command, first send included
    pub const COMMAND_MAX_ATTEMPTS: u32 = 4;

    /// Interval of the issuer-side retry ticker
    pub const RETRY_TICK_MS: u64 = 500;

    /// Acks remembered by the receiver for deduplication
    pub const ACK_CACHE_CAPACITY: usize = 1024;

    /// Base delay of the reconnect backoff
    pub const RECONNECT_BASE_DELAY_MS: u64 = 500;

    /// Cap of the reconnect backoff
    pub const RECONNECT_MAX_DELAY_MS: u64 = 30000;

    /// Timeout of a single connect attempt
    pub const CONNECT_TIMEOUT_MS: u64 = 5000;

    /// Publishes buffered while disconnected
    pub const OUTBOUND_BUFFER_CAPACITY: usize = 256;

    /// Bound on a single actuator execution
    pub const EXECUTION_TIMEOUT_MS: u64 = 10000;

    /// MQTT keep-alive
    pub const KEEP_ALIVE_SECS: u64 = 30;
}
