//! Voice join handshake: gateway state update, server rendezvous, voice
//! socket identify, UDP discovery and protocol selection.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use cadence_codec::crypto::KEY_SIZE;
use cadence_codec::{CryptoError, EncryptionMode, PacketSealer};
use cadence_gateway::{GatewayHandle, ReconnectPolicy};
use cadence_models::voice::{
    SelectProtocol, SessionDescription, VoiceHello, VoiceIdentify, VoiceMessage, VoiceReady,
    VOICE_GATEWAY_VERSION, VOICE_OP_HELLO, VOICE_OP_IDENTIFY, VOICE_OP_READY,
    VOICE_OP_SELECT_PROTOCOL, VOICE_OP_SESSION_DESCRIPTION,
};
use cadence_models::Snowflake;
use cadence_transport::{connect_udp, discover, DiscoveredAddress, RtpContext, VoiceSender};
use cadence_ws::wire::{wire_log_close, wire_log_in, wire_log_out, Channel};
use cadence_ws::{connect, ConnectSettings, Frame, HeartbeatSupervisor, OpCode, WsFramed};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::net::UdpSocket;

use crate::pipeline::PipelineSettings;
use crate::rendezvous::{VoiceRendezvous, VoiceServerInfo};
use crate::VoiceError;

#[derive(Debug, Clone)]
pub struct VoiceSettings {
    /// How long to wait for both voice dispatches after the state update.
    pub rendezvous_timeout: Duration,
    /// Per-step limit for socket connect, each awaited opcode and discovery.
    pub step_timeout: Duration,
    pub policy: ReconnectPolicy,
    pub connect: ConnectSettings,
    pub self_mute: bool,
    pub self_deaf: bool,
    /// Decode and forward inbound voice.
    pub receive: bool,
    pub pipeline: PipelineSettings,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            rendezvous_timeout: Duration::from_secs(10),
            step_timeout: Duration::from_secs(5),
            policy: ReconnectPolicy::default(),
            connect: ConnectSettings::default(),
            self_mute: false,
            self_deaf: false,
            receive: false,
            pipeline: PipelineSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JoinRequest {
    pub guild_id: Snowflake,
    pub channel_id: Snowflake,
}

/// A fully negotiated voice session, ready to carry media.
pub struct VoiceSession {
    pub framed: WsFramed,
    pub server: VoiceServerInfo,
    pub heartbeat: HeartbeatSupervisor,
    pub ssrc: u32,
    pub mode: EncryptionMode,
    pub secret_key: [u8; KEY_SIZE],
    pub socket: Arc<UdpSocket>,
    pub external: DiscoveredAddress,
}

impl VoiceSession {
    pub fn sealer(&self) -> Result<PacketSealer, CryptoError> {
        PacketSealer::new(self.mode, &self.secret_key)
    }

    /// Outbound sender starting a fresh RTP context for this session's SSRC.
    pub fn sender(&self) -> Result<VoiceSender, CryptoError> {
        Ok(VoiceSender::new(
            Arc::clone(&self.socket),
            self.sealer()?,
            RtpContext::new(self.ssrc),
        ))
    }
}

/// Voice socket URL for a server endpoint. The port the platform appends is
/// not the socket port, so only the host is kept. Explicit `ws://` and
/// `wss://` URLs pass through untouched.
pub fn voice_url(endpoint: &str) -> String {
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        return endpoint.to_string();
    }
    let host = endpoint.split(':').next().unwrap_or(endpoint);
    format!("wss://{host}/?v={VOICE_GATEWAY_VERSION}")
}

/// Run the whole join: gateway state updates, rendezvous and the voice
/// handshake.
pub async fn establish(
    gateway: &GatewayHandle,
    rendezvous: &Arc<VoiceRendezvous>,
    request: JoinRequest,
    settings: &VoiceSettings,
) -> Result<VoiceSession, VoiceError> {
    let user_id = gateway.current_user().ok_or(VoiceError::NotReady)?;
    let registration = rendezvous.register(request.guild_id, user_id);

    // Leave first so the platform always issues a fresh session.
    gateway
        .update_voice_state(request.guild_id, None, settings.self_mute, settings.self_deaf)
        .await?;
    gateway
        .update_voice_state(
            request.guild_id,
            Some(request.channel_id),
            settings.self_mute,
            settings.self_deaf,
        )
        .await?;

    let server = registration.wait(settings.rendezvous_timeout).await?;
    tracing::info!(
        guild_id = %request.guild_id,
        channel_id = %request.channel_id,
        endpoint = %server.endpoint,
        "voice server assigned"
    );
    handshake(server, settings).await
}

/// Open the voice socket for an assigned server and negotiate transport.
pub async fn handshake(
    server: VoiceServerInfo,
    settings: &VoiceSettings,
) -> Result<VoiceSession, VoiceError> {
    let step = settings.step_timeout;
    let url = voice_url(&server.endpoint);
    let mut framed = tokio::time::timeout(step, connect(&url, settings.connect))
        .await
        .map_err(|_| VoiceError::Timeout { step: "voice socket", after: step })??;

    let hello: VoiceHello = expect_op(&mut framed, VOICE_OP_HELLO, "hello", step).await?;
    let interval = Duration::from_secs_f64(hello.heartbeat_interval.max(1.0) / 1000.0);
    let heartbeat = HeartbeatSupervisor::new(interval);
    tracing::debug!(interval_ms = interval.as_millis() as u64, "voice hello");

    let identify = VoiceIdentify {
        server_id: server.guild_id,
        user_id: server.user_id,
        session_id: server.session_id.clone(),
        token: server.token.clone(),
    };
    send_voice(&mut framed, &VoiceMessage::new(VOICE_OP_IDENTIFY, &identify)?).await?;

    let ready: VoiceReady = expect_op(&mut framed, VOICE_OP_READY, "ready", step).await?;
    let mode = EncryptionMode::negotiate(&ready.modes)
        .ok_or_else(|| VoiceError::UnsupportedModes(ready.modes.clone()))?;
    let ip: IpAddr = ready
        .ip
        .parse()
        .map_err(|_| VoiceError::InvalidAddress(ready.ip.clone()))?;

    let socket = connect_udp(ip, ready.port).await?;
    let external = discover(&socket, ready.ssrc, step).await?;

    let select = SelectProtocol::udp(external.ip.to_string(), external.port, mode.name().to_string());
    send_voice(&mut framed, &VoiceMessage::new(VOICE_OP_SELECT_PROTOCOL, &select)?).await?;

    let description: SessionDescription =
        expect_op(&mut framed, VOICE_OP_SESSION_DESCRIPTION, "session description", step).await?;
    let secret_key: [u8; KEY_SIZE] = description
        .secret_key
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength(description.secret_key.len()))?;
    let mode = match description.mode.parse::<EncryptionMode>() {
        Ok(confirmed) => confirmed,
        Err(_) => {
            tracing::warn!(offered = %description.mode, selected = %mode, "server confirmed unknown mode, keeping ours");
            mode
        }
    };

    tracing::info!(
        guild_id = %server.guild_id,
        ssrc = ready.ssrc,
        %mode,
        external_ip = %external.ip,
        external_port = external.port,
        "voice session established"
    );

    Ok(VoiceSession {
        framed,
        server,
        heartbeat,
        ssrc: ready.ssrc,
        mode,
        secret_key,
        socket: Arc::new(socket),
        external,
    })
}

pub(crate) async fn send_voice(framed: &mut WsFramed, message: &VoiceMessage) -> Result<(), VoiceError> {
    let payload = serde_json::to_string(message)?;
    wire_log_out(Channel::Voice, message.op, &payload);
    framed
        .send(Frame::text(payload))
        .await
        .map_err(|_| VoiceError::Closed { code: None })
}

/// Read until a payload with `op` arrives. Other opcodes are skipped.
async fn expect_op<T: DeserializeOwned>(
    framed: &mut WsFramed,
    op: u8,
    step: &'static str,
    limit: Duration,
) -> Result<T, VoiceError> {
    let wait = async {
        loop {
            let frame = match framed.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, step, "voice read failed");
                    return Err(VoiceError::Closed { code: None });
                }
                None => return Err(VoiceError::Closed { code: None }),
            };
            match frame.opcode {
                OpCode::Text | OpCode::Binary => {
                    let Some(text) = frame.as_text() else { continue };
                    let message: VoiceMessage = match serde_json::from_str(text) {
                        Ok(message) => message,
                        Err(e) => {
                            tracing::warn!(error = %e, "discarding malformed voice payload");
                            continue;
                        }
                    };
                    wire_log_in(Channel::Voice, Some(message.op), text);
                    if message.op == op {
                        return serde_json::from_value::<T>(message.d).map_err(VoiceError::from);
                    }
                    tracing::debug!(op = message.op, waiting_for = step, "skipping voice payload");
                }
                OpCode::Ping => {
                    let _ = framed.send(Frame::pong(frame.payload.clone())).await;
                }
                OpCode::Close => {
                    let code = frame.close_code();
                    wire_log_close(Channel::Voice, code, frame.close_reason().unwrap_or(""));
                    return Err(VoiceError::Closed { code });
                }
                OpCode::Pong | OpCode::Continuation => {}
            }
        }
    };
    tokio::time::timeout(limit, wait)
        .await
        .map_err(|_| VoiceError::Timeout { step, after: limit })?
}
