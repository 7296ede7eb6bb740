use serde::{Deserialize, Serialize};

use crate::Snowflake;

// Voice socket opcodes (protocol v4)
pub const VOICE_OP_IDENTIFY: u8 = 0;
pub const VOICE_OP_SELECT_PROTOCOL: u8 = 1;
pub const VOICE_OP_READY: u8 = 2;
pub const VOICE_OP_HEARTBEAT: u8 = 3;
pub const VOICE_OP_SESSION_DESCRIPTION: u8 = 4;
pub const VOICE_OP_SPEAKING: u8 = 5;
pub const VOICE_OP_HEARTBEAT_ACK: u8 = 6;
pub const VOICE_OP_RESUME: u8 = 7;
pub const VOICE_OP_HELLO: u8 = 8;
pub const VOICE_OP_RESUMED: u8 = 9;
pub const VOICE_OP_CLIENT_DISCONNECT: u8 = 13;

pub const VOICE_GATEWAY_VERSION: u8 = 4;

// Voice socket close codes
pub const VOICE_CLOSE_AUTHENTICATION_FAILED: u16 = 4004;
pub const VOICE_CLOSE_SESSION_INVALID: u16 = 4006;
pub const VOICE_CLOSE_SESSION_TIMEOUT: u16 = 4009;
pub const VOICE_CLOSE_DISCONNECTED: u16 = 4014;
pub const VOICE_CLOSE_SERVER_CRASHED: u16 = 4015;
pub const VOICE_CLOSE_UNKNOWN_ENCRYPTION_MODE: u16 = 4016;

/// Speaking flag bits.
pub const SPEAKING_MICROPHONE: u8 = 1 << 0;
pub const SPEAKING_SOUNDSHARE: u8 = 1 << 1;
pub const SPEAKING_PRIORITY: u8 = 1 << 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceMessage {
    pub op: u8,
    #[serde(default)]
    pub d: serde_json::Value,
}

impl VoiceMessage {
    pub fn new<T: Serialize>(op: u8, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            op,
            d: serde_json::to_value(payload)?,
        })
    }

    pub fn heartbeat(nonce: u64) -> Self {
        Self {
            op: VOICE_OP_HEARTBEAT,
            d: serde_json::Value::from(nonce),
        }
    }

    pub fn data<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        serde_json::from_value(self.d.clone()).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceIdentify {
    pub server_id: Snowflake,
    pub user_id: Snowflake,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceHello {
    /// Milliseconds; the voice server sends this as a float.
    pub heartbeat_interval: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceReady {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectProtocol {
    pub protocol: String,
    pub data: SelectProtocolData,
}

impl SelectProtocol {
    pub fn udp(address: String, port: u16, mode: String) -> Self {
        Self {
            protocol: "udp".into(),
            data: SelectProtocolData {
                address,
                port,
                mode,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionDescription {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

/// Outbound speaking state for our own SSRC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speaking {
    pub speaking: u8,
    pub delay: u32,
    pub ssrc: u32,
}

/// Inbound speaking notice that maps a remote SSRC to a user.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeakingUpdate {
    pub user_id: Snowflake,
    pub ssrc: u32,
    #[serde(default)]
    pub speaking: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientDisconnect {
    pub user_id: Snowflake,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn select_protocol_shape() {
        let msg = VoiceMessage::new(
            VOICE_OP_SELECT_PROTOCOL,
            &SelectProtocol::udp("1.2.3.4".into(), 5000, "xsalsa20_poly1305".into()),
        )
        .unwrap();
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "op": 1,
                "d": {
                    "protocol": "udp",
                    "data": { "address": "1.2.3.4", "port": 5000, "mode": "xsalsa20_poly1305" }
                }
            })
        );
    }

    #[test]
    fn hello_interval_is_float() {
        let msg: VoiceMessage =
            serde_json::from_str(r#"{"op":8,"d":{"heartbeat_interval":13750.25}}"#).unwrap();
        let hello: VoiceHello = msg.data().unwrap();
        assert!((hello.heartbeat_interval - 13750.25).abs() < f64::EPSILON);
    }

    #[test]
    fn session_description_key_bytes() {
        let key: Vec<u8> = (0..32).collect();
        let msg: VoiceMessage = serde_json::from_value(json!({
            "op": 4,
            "d": { "mode": "xsalsa20_poly1305", "secret_key": key }
        }))
        .unwrap();
        let desc: SessionDescription = msg.data().unwrap();
        assert_eq!(desc.secret_key.len(), 32);
        assert_eq!(desc.secret_key[31], 31);
    }
}
