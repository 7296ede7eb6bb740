use serde::{Deserialize, Serialize};

use crate::{GatewayIntents, Snowflake};

// Client -> Server opcodes
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_PRESENCE_UPDATE: u8 = 3;
pub const OP_VOICE_STATE_UPDATE: u8 = 4;
pub const OP_RESUME: u8 = 6;

// Server -> Client opcodes
pub const OP_DISPATCH: u8 = 0;
pub const OP_RECONNECT: u8 = 7;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

// Close codes sent by the gateway
pub const CLOSE_UNKNOWN_ERROR: u16 = 4000;
pub const CLOSE_AUTHENTICATION_FAILED: u16 = 4004;
pub const CLOSE_INVALID_SEQ: u16 = 4007;
pub const CLOSE_SESSION_TIMED_OUT: u16 = 4009;
pub const CLOSE_INVALID_SHARD: u16 = 4010;
pub const CLOSE_SHARDING_REQUIRED: u16 = 4011;
pub const CLOSE_INVALID_API_VERSION: u16 = 4012;
pub const CLOSE_INVALID_INTENTS: u16 = 4013;
pub const CLOSE_DISALLOWED_INTENTS: u16 = 4014;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayMessage {
    pub fn new(op: u8, d: serde_json::Value) -> Self {
        Self {
            op,
            d: Some(d),
            s: None,
            t: None,
        }
    }

    /// `{"op":1,"d":<last seq or null>}`
    pub fn heartbeat(last_sequence: Option<u64>) -> Self {
        Self::new(
            OP_HEARTBEAT,
            last_sequence.map_or(serde_json::Value::Null, serde_json::Value::from),
        )
    }

    pub fn identify(identify: &Identify) -> serde_json::Result<Self> {
        Ok(Self::new(OP_IDENTIFY, serde_json::to_value(identify)?))
    }

    pub fn resume(resume: &Resume) -> serde_json::Result<Self> {
        Ok(Self::new(OP_RESUME, serde_json::to_value(resume)?))
    }

    pub fn voice_state_update(update: &VoiceStateUpdate) -> serde_json::Result<Self> {
        Ok(Self::new(OP_VOICE_STATE_UPDATE, serde_json::to_value(update)?))
    }

    /// Deserialize the `d` field into a typed payload.
    pub fn data<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        self.d
            .as_ref()
            .and_then(|d| serde_json::from_value(d.clone()).ok())
    }
}

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
            browser: "cadence".into(),
            device: "cadence".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identify {
    pub token: String,
    pub intents: GatewayIntents,
    pub properties: ConnectionProperties,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// Op 4 payload. `channel_id: None` leaves the current voice channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    pub guild_id: Snowflake,
    pub channel_id: Option<Snowflake>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadyUser {
    pub id: Snowflake,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    pub user: ReadyUser,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceStateEvent {
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    #[serde(default)]
    pub channel_id: Option<Snowflake>,
    pub user_id: Snowflake,
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceServerEvent {
    pub guild_id: Snowflake,
    pub token: String,
    /// Null while the platform is still allocating a voice server.
    #[serde(default)]
    pub endpoint: Option<String>,
}

// Dispatch event names
pub const EVENT_READY: &str = "READY";
pub const EVENT_RESUMED: &str = "RESUMED";

// Interaction events
pub const EVENT_INTERACTION_CREATE: &str = "INTERACTION_CREATE";

// Voice events
pub const EVENT_VOICE_STATE_UPDATE: &str = "VOICE_STATE_UPDATE";
pub const EVENT_VOICE_SERVER_UPDATE: &str = "VOICE_SERVER_UPDATE";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn heartbeat_carries_last_sequence() {
        let msg = GatewayMessage::heartbeat(Some(42));
        assert_eq!(serde_json::to_value(&msg).unwrap(), json!({ "op": 1, "d": 42 }));

        let first = GatewayMessage::heartbeat(None);
        assert_eq!(serde_json::to_value(&first).unwrap(), json!({ "op": 1, "d": null }));
    }

    #[test]
    fn leave_update_serializes_null_channel() {
        let msg = GatewayMessage::voice_state_update(&VoiceStateUpdate {
            guild_id: Snowflake(10),
            channel_id: None,
            self_mute: false,
            self_deaf: true,
        })
        .unwrap();
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["op"], 4);
        assert_eq!(v["d"]["guild_id"], "10");
        assert!(v["d"]["channel_id"].is_null());
    }

    #[test]
    fn identify_payload_shape() {
        let msg = GatewayMessage::identify(&Identify {
            token: "abc".into(),
            intents: GatewayIntents::GUILDS,
            properties: ConnectionProperties::default(),
            shard: Some([0, 1]),
            presence: None,
            large_threshold: None,
        })
        .unwrap();
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["op"], 2);
        assert_eq!(v["d"]["intents"], 1);
        assert_eq!(v["d"]["shard"], json!([0, 1]));
        assert!(v["d"].get("presence").is_none());
    }

    #[test]
    fn parses_dispatch_envelope() {
        let raw = r#"{"op":0,"s":3,"t":"READY","d":{"session_id":"abc","user":{"id":"77"}}}"#;
        let msg: GatewayMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.s, Some(3));
        let ready: Ready = msg.data().unwrap();
        assert_eq!(ready.session_id, "abc");
        assert_eq!(ready.user.id, Snowflake(77));
        assert!(ready.resume_gateway_url.is_none());
    }
}
