//! Versioned payload codec
//!
//! Every broker payload is one protobuf [`Envelope`]:
//! ```text
//! [ schema_version (field 1) ][ body: telemetry | command | ack | state ]
//! ```
//!
//! Decoding fails closed. A payload that is truncated, oversized, carries no
//! version, holds a different body than the caller expects, or misses a
//! required field is rejected as a whole and must be discarded by the caller.
//! Unknown fields are skipped, so newer peers can add optional fields.

use bytes::{Bytes, BytesMut};
use prost::Message as _;
use thiserror::Error;
use uuid::Uuid;

use crate::message::{
    AckOutcome, Command, CommandAck, CommandType, Message, MessageKind, SecurityMode,
    SecurityState, StateReport, TelemetrySample,
};
use crate::proto::{
    envelope::Body, AckPayload, CommandPayload, Envelope, StatePayload, TelemetryPayload,
    WireCommandType, WireMode, WireOutcome,
};

/// Schema version written by this build
pub const SCHEMA_VERSION: u32 = 1;

/// Maximum payload size (256 KiB) accepted on either side
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("Payload carries no schema version")]
    MissingVersion,

    #[error("Envelope has no body")]
    MissingBody,

    #[error("Expected {expected} payload, found {found}")]
    UnexpectedKind {
        expected: MessageKind,
        found: MessageKind,
    },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    #[error("Protobuf decode error: {0}")]
    DecodeError(#[from] prost::DecodeError),

    #[error("Protobuf encode error: {0}")]
    EncodeError(#[from] prost::EncodeError),
}

/// Name used by the channel for any decode-side failure
pub type DecodeError = CodecError;

/// Encode a message into its versioned wire form
pub fn encode(message: &Message) -> Result<Bytes, CodecError> {
    let envelope = Envelope {
        schema_version: SCHEMA_VERSION,
        body: Some(to_wire(message)),
    };

    let msg_len = envelope.encoded_len();
    if msg_len > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(msg_len));
    }

    let mut buf = BytesMut::with_capacity(msg_len);
    envelope.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Decode a payload, requiring it to carry a body of `expected` kind
pub fn decode(buf: &[u8], expected: MessageKind) -> Result<Message, CodecError> {
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(buf.len()));
    }

    let envelope = Envelope::decode(buf)?;

    // Any version >= 1 is readable: unknown fields are ignored by protobuf
    if envelope.schema_version == 0 {
        return Err(CodecError::MissingVersion);
    }

    let body = envelope.body.ok_or(CodecError::MissingBody)?;
    let found = body_kind(&body);
    if found != expected {
        return Err(CodecError::UnexpectedKind { expected, found });
    }

    match body {
        Body::Telemetry(t) => telemetry_from_wire(t).map(Message::Telemetry),
        Body::Command(c) => command_from_wire(c).map(Message::Command),
        Body::Ack(a) => ack_from_wire(a).map(Message::Ack),
        Body::State(s) => state_from_wire(s).map(Message::State),
    }
}

fn body_kind(body: &Body) -> MessageKind {
    match body {
        Body::Telemetry(_) => MessageKind::Telemetry,
        Body::Command(_) => MessageKind::Command,
        Body::Ack(_) => MessageKind::Ack,
        Body::State(_) => MessageKind::State,
    }
}

fn to_wire(message: &Message) -> Body {
    match message {
        Message::Telemetry(sample) => Body::Telemetry(TelemetryPayload {
            device_id: sample.device_id.clone(),
            timestamp_ms: sample.timestamp_ms,
            readings: sample.readings.clone(),
            mode: mode_to_wire(sample.mode).into(),
        }),
        Message::Command(command) => Body::Command(CommandPayload {
            command_id: command.command_id.to_string(),
            command_type: command_type_to_wire(command.command_type).into(),
            target_device_id: command.target_device_id.clone(),
            payload: command.payload.clone(),
            issued_at_ms: command.issued_at_ms,
        }),
        Message::Ack(ack) => Body::Ack(AckPayload {
            command_id: ack.command_id.to_string(),
            outcome: outcome_to_wire(ack.outcome).into(),
            detail: ack.detail.clone(),
        }),
        Message::State(report) => Body::State(StatePayload {
            device_id: report.device_id.clone(),
            mode: mode_to_wire(report.state.mode).into(),
            active_alert_id: report.state.active_alert_id.clone(),
            entered_at_ms: report.state.entered_at_ms,
            seq: report.state.seq,
            epoch: report.state.epoch,
        }),
    }
}

fn telemetry_from_wire(t: TelemetryPayload) -> Result<TelemetrySample, CodecError> {
    Ok(TelemetrySample {
        device_id: required_string("device_id", t.device_id)?,
        timestamp_ms: required_nonzero("timestamp_ms", t.timestamp_ms)?,
        readings: t.readings,
        mode: drone_mode_from_wire(t.mode)?,
    })
}

fn command_from_wire(c: CommandPayload) -> Result<Command, CodecError> {
    let command_type = match WireCommandType::try_from(c.command_type) {
        Ok(WireCommandType::CmdAcknowledge) => CommandType::Acknowledge,
        Ok(WireCommandType::CmdAbort) => CommandType::Abort,
        Ok(WireCommandType::CmdLand) => CommandType::Land,
        Ok(WireCommandType::CmdResume) => CommandType::Resume,
        Ok(WireCommandType::CmdHalt) => CommandType::Halt,
        Ok(WireCommandType::CmdProceed) => CommandType::Proceed,
        Ok(WireCommandType::CmdUnspecified) => return Err(CodecError::MissingField("command_type")),
        Err(_) => {
            return Err(CodecError::InvalidField {
                field: "command_type",
                reason: format!("unknown value {}", c.command_type),
            })
        }
    };

    Ok(Command {
        command_id: parse_uuid(&c.command_id)?,
        command_type,
        target_device_id: required_string("target_device_id", c.target_device_id)?,
        payload: c.payload,
        issued_at_ms: required_nonzero("issued_at_ms", c.issued_at_ms)?,
    })
}

fn ack_from_wire(a: AckPayload) -> Result<CommandAck, CodecError> {
    let outcome = match WireOutcome::try_from(a.outcome) {
        Ok(WireOutcome::OutcomeAccepted) => AckOutcome::Accepted,
        Ok(WireOutcome::OutcomeRejected) => AckOutcome::Rejected,
        Ok(WireOutcome::OutcomeExecuted) => AckOutcome::Executed,
        Ok(WireOutcome::OutcomeFailed) => AckOutcome::Failed,
        Ok(WireOutcome::OutcomeUnspecified) => return Err(CodecError::MissingField("outcome")),
        Err(_) => {
            return Err(CodecError::InvalidField {
                field: "outcome",
                reason: format!("unknown value {}", a.outcome),
            })
        }
    };

    Ok(CommandAck {
        command_id: parse_uuid(&a.command_id)?,
        outcome,
        detail: a.detail,
    })
}

fn state_from_wire(s: StatePayload) -> Result<StateReport, CodecError> {
    Ok(StateReport {
        device_id: required_string("device_id", s.device_id)?,
        state: SecurityState {
            mode: drone_mode_from_wire(s.mode)?,
            active_alert_id: s.active_alert_id.filter(|id| !id.is_empty()),
            entered_at_ms: required_nonzero("entered_at_ms", s.entered_at_ms)?,
            epoch: required_nonzero("epoch", s.epoch)?,
            seq: s.seq,
        },
    })
}

fn mode_to_wire(mode: SecurityMode) -> WireMode {
    match mode {
        SecurityMode::Normal => WireMode::ModeNormal,
        SecurityMode::Warning => WireMode::ModeWarning,
        SecurityMode::Alert => WireMode::ModeAlert,
        SecurityMode::Maintenance => WireMode::ModeMaintenance,
        SecurityMode::Offline => WireMode::ModeOffline,
    }
}

/// Modes a drone may report. OFFLINE is synthesized by the operator and never
/// travels on the wire from a drone.
fn drone_mode_from_wire(value: i32) -> Result<SecurityMode, CodecError> {
    match WireMode::try_from(value) {
        Ok(WireMode::ModeNormal) => Ok(SecurityMode::Normal),
        Ok(WireMode::ModeWarning) => Ok(SecurityMode::Warning),
        Ok(WireMode::ModeAlert) => Ok(SecurityMode::Alert),
        Ok(WireMode::ModeMaintenance) => Ok(SecurityMode::Maintenance),
        Ok(WireMode::ModeUnspecified) => Err(CodecError::MissingField("mode")),
        Ok(WireMode::ModeOffline) => Err(CodecError::InvalidField {
            field: "mode",
            reason: "OFFLINE is never reported by a drone".into(),
        }),
        Err(_) => Err(CodecError::InvalidField {
            field: "mode",
            reason: format!("unknown value {value}"),
        }),
    }
}

fn command_type_to_wire(command_type: CommandType) -> WireCommandType {
    match command_type {
        CommandType::Acknowledge => WireCommandType::CmdAcknowledge,
        CommandType::Abort => WireCommandType::CmdAbort,
        CommandType::Land => WireCommandType::CmdLand,
        CommandType::Resume => WireCommandType::CmdResume,
        CommandType::Halt => WireCommandType::CmdHalt,
        CommandType::Proceed => WireCommandType::CmdProceed,
    }
}

fn outcome_to_wire(outcome: AckOutcome) -> WireOutcome {
    match outcome {
        AckOutcome::Accepted => WireOutcome::OutcomeAccepted,
        AckOutcome::Rejected => WireOutcome::OutcomeRejected,
        AckOutcome::Executed => WireOutcome::OutcomeExecuted,
        AckOutcome::Failed => WireOutcome::OutcomeFailed,
    }
}

fn required_string(field: &'static str, value: String) -> Result<String, CodecError> {
    if value.is_empty() {
        Err(CodecError::MissingField(field))
    } else {
        Ok(value)
    }
}

fn required_nonzero(field: &'static str, value: u64) -> Result<u64, CodecError> {
    if value == 0 {
        Err(CodecError::MissingField(field))
    } else {
        Ok(value)
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, CodecError> {
    if value.is_empty() {
        return Err(CodecError::MissingField("command_id"));
    }
    Uuid::parse_str(value).map_err(|e| CodecError::InvalidField {
        field: "command_id",
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample() -> TelemetrySample {
        let mut readings = BTreeMap::new();
        readings.insert("temp".to_string(), 95.0);
        readings.insert("proximity".to_string(), 40.5);
        TelemetrySample {
            device_id: "drone-1".into(),
            timestamp_ms: 1_700_000_000_000,
            readings,
            mode: SecurityMode::Warning,
        }
    }

    fn all_messages() -> Vec<Message> {
        let command = Command::new(CommandType::Land, "drone-1", b"{\"reason\":\"alert\"}".to_vec());
        vec![
            Message::Telemetry(sample()),
            Message::Command(command.clone()),
            Message::Ack(CommandAck::executed(command.command_id, "landed")),
            Message::State(StateReport {
                device_id: "drone-1".into(),
                state: SecurityState {
                    mode: SecurityMode::Alert,
                    active_alert_id: Some("temp-1".into()),
                    entered_at_ms: 1_700_000_000_500,
                    epoch: 1_700_000_000_000,
                    seq: 7,
                },
            }),
            Message::State(StateReport {
                device_id: "drone-1".into(),
                state: SecurityState::initial(1_700_000_000_000),
            }),
        ]
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        for original in all_messages() {
            let encoded = encode(&original).expect("encode failed");
            let decoded = decode(&encoded, original.kind()).expect("decode failed");
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let message = Message::Telemetry(sample());
        assert_eq!(encode(&message).unwrap(), encode(&message.clone()).unwrap());
    }

    #[test]
    fn test_version_is_leading_field() {
        let encoded = encode(&Message::Telemetry(sample())).unwrap();
        // field 1, varint wire type, then the version itself
        assert_eq!(encoded[0], 0x08);
        assert_eq!(encoded[1], SCHEMA_VERSION as u8);
    }

    #[test]
    fn test_truncated_payload_fails() {
        let encoded = encode(&Message::Telemetry(sample())).unwrap();
        let result = decode(&encoded[..encoded.len() - 3], MessageKind::Telemetry);
        assert!(matches!(result, Err(CodecError::DecodeError(_))));
    }

    #[test]
    fn test_garbage_fails() {
        let result = decode(&[0xff, 0xff, 0xff, 0xff, 0xff], MessageKind::Command);
        assert!(result.is_err());
    }

    #[test]
    fn test_wrong_kind_fails() {
        let encoded = encode(&Message::Telemetry(sample())).unwrap();
        let result = decode(&encoded, MessageKind::Command);
        assert!(matches!(
            result,
            Err(CodecError::UnexpectedKind {
                expected: MessageKind::Command,
                found: MessageKind::Telemetry
            })
        ));
    }

    #[test]
    fn test_missing_version_fails() {
        let envelope = Envelope {
            schema_version: 0,
            body: Some(to_wire(&Message::Telemetry(sample()))),
        };
        let result = decode(&envelope.encode_to_vec(), MessageKind::Telemetry);
        assert!(matches!(result, Err(CodecError::MissingVersion)));
    }

    #[test]
    fn test_future_version_with_unknown_field_is_accepted() {
        let envelope = Envelope {
            schema_version: SCHEMA_VERSION + 1,
            body: Some(to_wire(&Message::Telemetry(sample()))),
        };
        let mut bytes = envelope.encode_to_vec();
        // unknown field 15, varint 1
        bytes.extend_from_slice(&[0x78, 0x01]);

        let decoded = decode(&bytes, MessageKind::Telemetry).expect("decode failed");
        assert_eq!(decoded, Message::Telemetry(sample()));
    }

    #[test]
    fn test_missing_required_field_fails() {
        let envelope = Envelope {
            schema_version: SCHEMA_VERSION,
            body: Some(Body::Ack(AckPayload {
                command_id: String::new(),
                outcome: WireOutcome::OutcomeAccepted.into(),
                detail: String::new(),
            })),
        };
        let result = decode(&envelope.encode_to_vec(), MessageKind::Ack);
        assert!(matches!(result, Err(CodecError::MissingField("command_id"))));
    }

    #[test]
    fn test_state_without_epoch_fails() {
        let envelope = Envelope {
            schema_version: SCHEMA_VERSION,
            body: Some(Body::State(StatePayload {
                device_id: "drone-1".into(),
                mode: WireMode::ModeWarning.into(),
                active_alert_id: None,
                entered_at_ms: 5,
                seq: 1,
                epoch: 0,
            })),
        };
        let result = decode(&envelope.encode_to_vec(), MessageKind::State);
        assert!(matches!(result, Err(CodecError::MissingField("epoch"))));
    }

    #[test]
    fn test_bad_command_id_fails() {
        let envelope = Envelope {
            schema_version: SCHEMA_VERSION,
            body: Some(Body::Ack(AckPayload {
                command_id: "not-a-uuid".into(),
                outcome: WireOutcome::OutcomeAccepted.into(),
                detail: String::new(),
            })),
        };
        let result = decode(&envelope.encode_to_vec(), MessageKind::Ack);
        assert!(matches!(result, Err(CodecError::InvalidField { .. })));
    }

    #[test]
    fn test_unknown_command_type_fails() {
        let envelope = Envelope {
            schema_version: SCHEMA_VERSION,
            body: Some(Body::Command(CommandPayload {
                command_id: Uuid::new_v4().to_string(),
                command_type: 42,
                target_device_id: "drone-1".into(),
                payload: Vec::new(),
                issued_at_ms: 1,
            })),
        };
        let result = decode(&envelope.encode_to_vec(), MessageKind::Command);
        assert!(matches!(result, Err(CodecError::InvalidField { field: "command_type", .. })));
    }

    #[test]
    fn test_drone_cannot_report_offline() {
        let mut offline = sample();
        offline.mode = SecurityMode::Offline;
        let encoded = encode(&Message::Telemetry(offline)).unwrap();
        assert!(decode(&encoded, MessageKind::Telemetry).is_err());
    }

    #[test]
    fn test_message_too_large() {
        let command = Command::new(CommandType::Halt, "drone-1", vec![0u8; MAX_MESSAGE_SIZE + 1]);
        let result = encode(&Message::Command(command));
        assert!(matches!(result, Err(CodecError::MessageTooLarge(_))));
    }
}
