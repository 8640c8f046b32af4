//! Broker session with mutual TLS and automatic reconnection
//!
//! This module handles:
//! - Authenticated connection to the message broker
//! - Reconnection with exponential backoff and jitter
//! - Buffering of publishes while disconnected
//! - Re-establishing subscriptions after reconnect

mod auth;
mod backoff;
mod manager;
pub mod memory;
pub mod mqtt;
mod traits;

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::message::DeviceIdentity;

pub use auth::{
    certificate_fingerprint, certificate_names, AuthError, Credentials, FingerprintPolicy,
    IdentityPolicy,
};
pub use backoff::Backoff;
pub use manager::{Session, SessionConfig};
pub use traits::{BrokerConnector, BrokerLink};

/// Delivery guarantee of a publish or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// First connect attempt in progress
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal: shut down, or refused authentication
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::Reconnecting => "RECONNECTING",
            SessionState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// Observable session status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub identity: DeviceIdentity,
    pub state: SessionState,
    pub last_error: Option<String>,
}

/// A message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("connect timed out")]
    Timeout,

    #[error("broker refused connection: {0}")]
    Refused(String),
}

impl From<AuthError> for ConnectError {
    fn from(err: AuthError) -> Self {
        ConnectError::AuthFailed(err.to_string())
    }
}

/// Failure of an established link. Recovered by reconnecting.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("link closed")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("session closed")]
    Closed,

    #[error("invalid topic: {0}")]
    InvalidTopic(String),
}
