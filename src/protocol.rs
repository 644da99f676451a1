//! Gateway wire format: the `{op, d, s, t}` envelope, opcodes, handshake
//! payloads and close-code classification.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;

/// Intent bit that makes the gateway stream `GUILD_CREATE` for every guild
/// announced in READY.
pub const GUILDS_INTENT: u64 = 1 << 0;

/// Close code used when the shard drops a socket it expects to resume.
pub const CLOSE_RECONNECT: u16 = 4000;
/// Close code used for zombie connections and handshake timeouts.
pub const CLOSE_SESSION_TIMEOUT: u16 = 4009;
/// Normal closure, used for explicit teardown.
pub const CLOSE_NORMAL: u16 = 1000;
/// Reported when the transport vanished without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Reported when the socket never confirmed closure.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Gateway opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum OpCode {
    Dispatch,
    Heartbeat,
    Identify,
    PresenceUpdate,
    VoiceStateUpdate,
    Resume,
    Reconnect,
    RequestGuildMembers,
    InvalidSession,
    Hello,
    HeartbeatAck,
}

impl OpCode {
    /// Frames with these opcodes jump the outbound queue.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            OpCode::Heartbeat | OpCode::Identify | OpCode::Resume | OpCode::HeartbeatAck
        )
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        match op {
            OpCode::Dispatch => 0,
            OpCode::Heartbeat => 1,
            OpCode::Identify => 2,
            OpCode::PresenceUpdate => 3,
            OpCode::VoiceStateUpdate => 4,
            OpCode::Resume => 6,
            OpCode::Reconnect => 7,
            OpCode::RequestGuildMembers => 8,
            OpCode::InvalidSession => 9,
            OpCode::Hello => 10,
            OpCode::HeartbeatAck => 11,
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = UnknownOpCode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => OpCode::Dispatch,
            1 => OpCode::Heartbeat,
            2 => OpCode::Identify,
            3 => OpCode::PresenceUpdate,
            4 => OpCode::VoiceStateUpdate,
            6 => OpCode::Resume,
            7 => OpCode::Reconnect,
            8 => OpCode::RequestGuildMembers,
            9 => OpCode::InvalidSession,
            10 => OpCode::Hello,
            11 => OpCode::HeartbeatAck,
            other => return Err(UnknownOpCode(other)),
        })
    }
}

/// Opcode outside the known table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownOpCode(pub u8);

impl fmt::Display for UnknownOpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown opcode {}", self.0)
    }
}

/// One gateway frame in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub op: OpCode,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<i64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl GatewayFrame {
    /// Build an outbound frame with the given opcode and payload.
    pub fn new(op: OpCode, d: Value) -> Self {
        Self { op, d, s: None, t: None }
    }

    /// Heartbeat carrying the last sequence, or `null` before any dispatch.
    pub fn heartbeat(sequence: i64) -> Self {
        let d = if sequence < 0 { Value::Null } else { json!(sequence) };
        Self::new(OpCode::Heartbeat, d)
    }

    pub fn identify(payload: &IdentifyPayload) -> Self {
        Self::new(OpCode::Identify, json!(payload))
    }

    pub fn resume(payload: &ResumePayload) -> Self {
        Self::new(OpCode::Resume, json!(payload))
    }

    /// Parse a text payload received from the socket.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn event_name(&self) -> Option<&str> {
        self.t.as_deref()
    }
}

/// `d` of HELLO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HelloPayload {
    pub heartbeat_interval: u64,
}

/// Client properties sent with IDENTIFY.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// `d` of IDENTIFY.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub intents: u64,
    pub properties: ConnectionProperties,
    pub shard: [u32; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,
}

/// `d` of RESUME.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    pub seq: i64,
}

/// The parts of the READY dispatch the transport needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
}

impl ReadyPayload {
    pub fn guild_ids(&self) -> HashSet<String> {
        self.guilds.iter().map(|g| g.id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UnavailableGuild {
    pub id: String,
}

/// How a close code should be handled by the reconnect logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// Authentication or permanent configuration failure. Never retried.
    Fatal,
    /// The session cannot be resumed; reconnect with IDENTIFY.
    NewSession,
    /// Reconnect and try to RESUME.
    Resumable,
}

/// Classify a close code received from the gateway.
pub fn classify_close(code: u16) -> CloseClass {
    match code {
        // authentication failed, invalid shard, sharding required,
        // invalid API version, invalid intents, disallowed intents
        4004 | 4010 | 4011 | 4012 | 4013 | 4014 => CloseClass::Fatal,
        // normal closure, session no longer valid, invalid seq, session timed out
        1000 | 4006 | 4007 | 4009 => CloseClass::NewSession,
        _ => CloseClass::Resumable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dispatch_frame() {
        let frame = GatewayFrame::parse(
            r#"{"op":0,"d":{"id":"41771983423143937"},"s":7,"t":"GUILD_CREATE"}"#,
        )
        .unwrap();

        assert_eq!(frame.op, OpCode::Dispatch);
        assert_eq!(frame.s, Some(7));
        assert_eq!(frame.event_name(), Some("GUILD_CREATE"));
        assert_eq!(frame.d["id"], "41771983423143937");
    }

    #[test]
    fn test_parse_frame_with_missing_fields() {
        let frame = GatewayFrame::parse(r#"{"op":11}"#).unwrap();
        assert_eq!(frame.op, OpCode::HeartbeatAck);
        assert!(frame.d.is_null());
        assert_eq!(frame.s, None);
        assert_eq!(frame.t, None);
    }

    #[test]
    fn test_unknown_opcode_is_rejected() {
        assert!(GatewayFrame::parse(r#"{"op":5,"d":null}"#).is_err());
        assert!(GatewayFrame::parse(r#"{"op":42}"#).is_err());
        assert_eq!(OpCode::try_from(5), Err(UnknownOpCode(5)));
    }

    #[test]
    fn test_heartbeat_payload() {
        assert_eq!(GatewayFrame::heartbeat(-1).d, Value::Null);
        assert_eq!(GatewayFrame::heartbeat(251).d, json!(251));
        assert_eq!(
            GatewayFrame::heartbeat(3).to_json().unwrap(),
            r#"{"op":1,"d":3,"s":null,"t":null}"#
        );
    }

    #[test]
    fn test_identify_payload_shape() {
        let payload = IdentifyPayload {
            token: "t0k3n".into(),
            intents: 513,
            properties: ConnectionProperties {
                os: "linux".into(),
                browser: "test".into(),
                device: "test".into(),
            },
            shard: [1, 4],
            compress: None,
            large_threshold: Some(250),
            presence: None,
        };
        let frame = GatewayFrame::identify(&payload);

        assert_eq!(frame.op, OpCode::Identify);
        assert_eq!(frame.d["shard"], json!([1, 4]));
        assert_eq!(frame.d["large_threshold"], 250);
        assert!(frame.d.get("compress").is_none());
        assert!(frame.d.get("presence").is_none());
    }

    #[test]
    fn test_ready_payload_guilds() {
        let ready: ReadyPayload = serde_json::from_value(json!({
            "v": 10,
            "session_id": "abc",
            "resume_gateway_url": "wss://resume.example",
            "guilds": [{"id": "1", "unavailable": true}, {"id": "2", "unavailable": true}],
        }))
        .unwrap();

        assert_eq!(ready.session_id, "abc");
        assert_eq!(ready.resume_gateway_url.as_deref(), Some("wss://resume.example"));
        assert_eq!(ready.guild_ids().len(), 2);
    }

    #[test]
    fn test_control_opcodes() {
        assert!(OpCode::Heartbeat.is_control());
        assert!(OpCode::Identify.is_control());
        assert!(OpCode::Resume.is_control());
        assert!(!OpCode::PresenceUpdate.is_control());
        assert!(!OpCode::RequestGuildMembers.is_control());
    }

    #[test]
    fn test_close_classification() {
        assert_eq!(classify_close(4004), CloseClass::Fatal);
        assert_eq!(classify_close(4014), CloseClass::Fatal);
        assert_eq!(classify_close(4009), CloseClass::NewSession);
        assert_eq!(classify_close(1000), CloseClass::NewSession);
        assert_eq!(classify_close(4000), CloseClass::Resumable);
        assert_eq!(classify_close(1006), CloseClass::Resumable);
    }
}
