//! Wire-level protobuf messages
//!
//! Every payload published on the broker is a single [`Envelope`]:
//! ```text
//! field 1: schema_version (u32)   -- always encoded first
//! field 2..5: exactly one body    -- telemetry | command | ack | state
//! ```
//! Fields are plain protobuf scalars; validation and conversion into the
//! strongly typed domain messages happens in [`crate::codec`].

use std::collections::BTreeMap;

use prost::{Enumeration, Message};

/// Top-level frame for all channel traffic
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(uint32, tag = "1")]
    pub schema_version: u32,

    #[prost(oneof = "envelope::Body", tags = "2, 3, 4, 5")]
    pub body: Option<envelope::Body>,
}

pub mod envelope {
    use prost::Oneof;

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Body {
        #[prost(message, tag = "2")]
        Telemetry(super::TelemetryPayload),
        #[prost(message, tag = "3")]
        Command(super::CommandPayload),
        #[prost(message, tag = "4")]
        Ack(super::AckPayload),
        #[prost(message, tag = "5")]
        State(super::StatePayload),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum WireMode {
    ModeUnspecified = 0,
    ModeNormal = 1,
    ModeWarning = 2,
    ModeAlert = 3,
    ModeMaintenance = 4,
    ModeOffline = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum WireCommandType {
    CmdUnspecified = 0,
    CmdAcknowledge = 1,
    CmdAbort = 2,
    CmdLand = 3,
    CmdResume = 4,
    CmdHalt = 5,
    CmdProceed = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum WireOutcome {
    OutcomeUnspecified = 0,
    OutcomeAccepted = 1,
    OutcomeRejected = 2,
    OutcomeExecuted = 3,
    OutcomeFailed = 4,
}

#[derive(Clone, PartialEq, Message)]
pub struct TelemetryPayload {
    #[prost(string, tag = "1")]
    pub device_id: String,

    #[prost(uint64, tag = "2")]
    pub timestamp_ms: u64,

    #[prost(btree_map = "string, double", tag = "3")]
    pub readings: BTreeMap<String, f64>,

    #[prost(enumeration = "WireMode", tag = "4")]
    pub mode: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct CommandPayload {
    #[prost(string, tag = "1")]
    pub command_id: String,

    #[prost(enumeration = "WireCommandType", tag = "2")]
    pub command_type: i32,

    #[prost(string, tag = "3")]
    pub target_device_id: String,

    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,

    #[prost(uint64, tag = "5")]
    pub issued_at_ms: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct AckPayload {
    #[prost(string, tag = "1")]
    pub command_id: String,

    #[prost(enumeration = "WireOutcome", tag = "2")]
    pub outcome: i32,

    #[prost(string, tag = "3")]
    pub detail: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct StatePayload {
    #[prost(string, tag = "1")]
    pub device_id: String,

    #[prost(enumeration = "WireMode", tag = "2")]
    pub mode: i32,

    #[prost(string, optional, tag = "3")]
    pub active_alert_id: Option<String>,

    #[prost(uint64, tag = "4")]
    pub entered_at_ms: u64,

    #[prost(uint64, tag = "5")]
    pub seq: u64,

    #[prost(uint64, tag = "6")]
    pub epoch: u64,
}
