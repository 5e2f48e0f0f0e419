//! Wire frames
//!
//! Every inbound frame has the shape `{op, d, s?, t?}`; outbound frames are `{op, d}`.

use super::opcodes::OpCode;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound frame exactly as decoded from the wire
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawPayload {
    /// Raw op code
    pub op: u8,
    /// Payload body
    #[serde(default)]
    pub d: Value,
    /// Sequence number, dispatch frames only
    #[serde(default)]
    pub s: Option<u64>,
    /// Event name, dispatch frames only
    #[serde(default)]
    pub t: Option<String>,
}

/// Inbound frame after op-code decoding
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// Event dispatch
    Dispatch { name: String, data: Value },
    /// Gateway asks for an immediate heartbeat
    Heartbeat,
    /// Gateway asks the client to reconnect
    Reconnect,
    /// Session invalidated
    InvalidSession { resumable: bool },
    /// First frame of every connection
    Hello { heartbeat_interval: u64 },
    /// Heartbeat acknowledged
    HeartbeatAck,
    /// Op code this client does not handle
    Unknown { op: u8 },
}

#[derive(Deserialize)]
struct HelloBody {
    heartbeat_interval: u64,
}

impl GatewayEvent {
    /// Decode the op-specific body of a raw frame
    pub fn from_raw(raw: RawPayload) -> Result<Self, Error> {
        let Some(op) = OpCode::from_u8(raw.op) else {
            return Ok(Self::Unknown { op: raw.op });
        };

        match op {
            OpCode::Dispatch => {
                let name = raw
                    .t
                    .ok_or_else(|| Error::Decode("dispatch frame without event name".to_string()))?;
                Ok(Self::Dispatch { name, data: raw.d })
            }
            OpCode::Heartbeat => Ok(Self::Heartbeat),
            OpCode::Reconnect => Ok(Self::Reconnect),
            OpCode::InvalidSession => Ok(Self::InvalidSession {
                resumable: raw.d.as_bool().unwrap_or(false),
            }),
            OpCode::Hello => {
                let body: HelloBody = serde_json::from_value(raw.d)
                    .map_err(|e| Error::Decode(format!("invalid HELLO: {e}")))?;
                Ok(Self::Hello {
                    heartbeat_interval: body.heartbeat_interval,
                })
            }
            OpCode::HeartbeatAck => Ok(Self::HeartbeatAck),
            // Send-only op codes are never expected from the gateway
            OpCode::Identify
            | OpCode::PresenceUpdate
            | OpCode::VoiceStateUpdate
            | OpCode::Resume
            | OpCode::RequestGuildMembers => Ok(Self::Unknown { op: raw.op }),
        }
    }
}

/// Outbound command frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundFrame {
    pub op: OpCode,
    pub d: Value,
}

impl OutboundFrame {
    pub fn new(op: OpCode, d: impl Serialize) -> Result<Self, Error> {
        let d = serde_json::to_value(d).map_err(|e| Error::Encode(e.to_string()))?;
        Ok(Self { op, d })
    }

    /// Copy of the frame body safe to log: the auth token is masked
    pub fn redacted(&self) -> Value {
        let mut d = self.d.clone();
        if let Some(token) = d.get_mut("token") {
            *token = Value::String("***".to_string());
        }
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_decode_hello() {
        let event = GatewayEvent::from_raw(raw(json!({"op": 10, "d": {"heartbeat_interval": 41250}}))).unwrap();
        assert_eq!(event, GatewayEvent::Hello { heartbeat_interval: 41250 });
    }

    #[test]
    fn test_decode_dispatch_requires_name() {
        let event = GatewayEvent::from_raw(raw(json!({"op": 0, "d": {}, "s": 3, "t": "READY"}))).unwrap();
        assert!(matches!(event, GatewayEvent::Dispatch { ref name, .. } if name == "READY"));

        assert!(GatewayEvent::from_raw(raw(json!({"op": 0, "d": {}, "s": 3}))).is_err());
    }

    #[test]
    fn test_decode_invalid_session() {
        let event = GatewayEvent::from_raw(raw(json!({"op": 9, "d": true}))).unwrap();
        assert_eq!(event, GatewayEvent::InvalidSession { resumable: true });
        let event = GatewayEvent::from_raw(raw(json!({"op": 9, "d": null}))).unwrap();
        assert_eq!(event, GatewayEvent::InvalidSession { resumable: false });
    }

    #[test]
    fn test_unknown_op_is_not_an_error() {
        let event = GatewayEvent::from_raw(raw(json!({"op": 42}))).unwrap();
        assert_eq!(event, GatewayEvent::Unknown { op: 42 });
    }

    #[test]
    fn test_redacted_masks_token() {
        let frame = OutboundFrame::new(OpCode::Identify, json!({"token": "secret", "intents": 1})).unwrap();
        let redacted = frame.redacted();
        assert_eq!(redacted["token"], "***");
        assert_eq!(redacted["intents"], 1);
        assert_eq!(frame.d["token"], "secret");
    }
}
