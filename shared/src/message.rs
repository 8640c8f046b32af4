//! Domain messages exchanged between the drone agent and the operator console

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::now_ms;

/// Which end of the channel a process is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Drone,
    Operator,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Drone => write!(f, "drone"),
            Role::Operator => write!(f, "operator"),
        }
    }
}

/// Identity presented when a session is established. Never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub role: Role,
    /// Lowercase hex SHA-256 of the device certificate (DER)
    pub certificate_fingerprint: String,
}

impl DeviceIdentity {
    pub fn new(
        device_id: impl Into<String>,
        role: Role,
        certificate_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            role,
            certificate_fingerprint: certificate_fingerprint.into(),
        }
    }
}

/// Security mode of a drone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityMode {
    Normal,
    Warning,
    Alert,
    Maintenance,
    /// Synthetic, only ever set by the operator mirror on liveness timeout
    Offline,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SecurityMode::Normal => "NORMAL",
            SecurityMode::Warning => "WARNING",
            SecurityMode::Alert => "ALERT",
            SecurityMode::Maintenance => "MAINTENANCE",
            SecurityMode::Offline => "OFFLINE",
        };
        f.write_str(name)
    }
}

/// A drone's security state as of its latest transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityState {
    pub mode: SecurityMode,
    pub active_alert_id: Option<String>,
    pub entered_at_ms: u64,
    /// Start time of the drone process that wrote this state, in ms since
    /// the Unix epoch. A restarted drone begins a new log under a later epoch.
    pub epoch: u64,
    /// Position in the drone's transition log, starts at 0 for the initial state
    pub seq: u64,
}

impl SecurityState {
    /// Initial state of a drone started at `entered_at_ms`
    pub fn initial(entered_at_ms: u64) -> Self {
        Self {
            mode: SecurityMode::Normal,
            active_alert_id: None,
            entered_at_ms,
            epoch: entered_at_ms,
            seq: 0,
        }
    }

    /// Later epoch, or same epoch and later position in the log
    pub fn is_newer_than(&self, other: &SecurityState) -> bool {
        (self.epoch, self.seq) > (other.epoch, other.seq)
    }
}

/// State published on `devices/{id}/state`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateReport {
    pub device_id: String,
    pub state: SecurityState,
}

/// One round of sensor readings
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub device_id: String,
    pub timestamp_ms: u64,
    pub readings: BTreeMap<String, f64>,
    /// Drone mode at the time the sample was taken
    pub mode: SecurityMode,
}

impl TelemetrySample {
    pub fn new(
        device_id: impl Into<String>,
        readings: BTreeMap<String, f64>,
        mode: SecurityMode,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp_ms: now_ms(),
            readings,
            mode,
        }
    }
}

/// Operator command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    Acknowledge,
    Abort,
    Land,
    Resume,
    Halt,
    Proceed,
}

impl CommandType {
    /// Commands that drive the actuator executor
    pub fn is_executable(&self) -> bool {
        matches!(
            self,
            CommandType::Abort | CommandType::Land | CommandType::Halt | CommandType::Proceed
        )
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandType::Acknowledge => "ACKNOWLEDGE",
            CommandType::Abort => "ABORT",
            CommandType::Land => "LAND",
            CommandType::Resume => "RESUME",
            CommandType::Halt => "HALT",
            CommandType::Proceed => "PROCEED",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for CommandType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ack" | "acknowledge" => Ok(CommandType::Acknowledge),
            "abort" => Ok(CommandType::Abort),
            "land" => Ok(CommandType::Land),
            "resume" => Ok(CommandType::Resume),
            "halt" => Ok(CommandType::Halt),
            "proceed" => Ok(CommandType::Proceed),
            other => Err(format!("unknown command type: {other}")),
        }
    }
}

/// A command issued by the operator. The id is never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub command_id: Uuid,
    pub command_type: CommandType,
    pub target_device_id: String,
    pub payload: Vec<u8>,
    pub issued_at_ms: u64,
}

impl Command {
    /// Create a command with a fresh id
    pub fn new(
        command_type: CommandType,
        target_device_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            command_type,
            target_device_id: target_device_id.into(),
            payload,
            issued_at_ms: now_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckOutcome {
    Accepted,
    Rejected,
    Executed,
    Failed,
}

impl fmt::Display for AckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AckOutcome::Accepted => "ACCEPTED",
            AckOutcome::Rejected => "REJECTED",
            AckOutcome::Executed => "EXECUTED",
            AckOutcome::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAck {
    pub command_id: Uuid,
    pub outcome: AckOutcome,
    pub detail: String,
}

impl CommandAck {
    pub fn accepted(command_id: Uuid, detail: impl Into<String>) -> Self {
        Self {
            command_id,
            outcome: AckOutcome::Accepted,
            detail: detail.into(),
        }
    }

    pub fn rejected(command_id: Uuid, detail: impl Into<String>) -> Self {
        Self {
            command_id,
            outcome: AckOutcome::Rejected,
            detail: detail.into(),
        }
    }

    pub fn executed(command_id: Uuid, detail: impl Into<String>) -> Self {
        Self {
            command_id,
            outcome: AckOutcome::Executed,
            detail: detail.into(),
        }
    }

    pub fn failed(command_id: Uuid, detail: impl Into<String>) -> Self {
        Self {
            command_id,
            outcome: AckOutcome::Failed,
            detail: detail.into(),
        }
    }
}

/// Payload kinds carried on the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Telemetry,
    Command,
    Ack,
    State,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Telemetry => "telemetry",
            MessageKind::Command => "command",
            MessageKind::Ack => "ack",
            MessageKind::State => "state",
        };
        f.write_str(name)
    }
}

/// Any message that can be encoded on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Telemetry(TelemetrySample),
    Command(Command),
    Ack(CommandAck),
    State(StateReport),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Telemetry(_) => MessageKind::Telemetry,
            Message::Command(_) => MessageKind::Command,
            Message::Ack(_) => MessageKind::Ack,
            Message::State(_) => MessageKind::State,
        }
    }
}
