use std::sync::Arc;

use cadence_gateway::{GatewayHandle, ReconnectState};
use cadence_models::voice::{
    ClientDisconnect, Speaking, SpeakingUpdate, VoiceMessage, SPEAKING_MICROPHONE,
    VOICE_CLOSE_AUTHENTICATION_FAILED, VOICE_CLOSE_DISCONNECTED,
    VOICE_CLOSE_UNKNOWN_ENCRYPTION_MODE, VOICE_OP_CLIENT_DISCONNECT, VOICE_OP_HEARTBEAT_ACK,
    VOICE_OP_SPEAKING,
};
use cadence_models::Snowflake;
use cadence_ws::wire::{wire_log_close, wire_log_in, wire_log_out, Channel};
use cadence_ws::{Beat, Frame, HeartbeatSupervisor, OpCode, WsFramed};
use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::pipeline::{AudioPipeline, PipelineHandle};
use crate::receiver::{spawn_receiver, VoicePacket};
use crate::rendezvous::VoiceRendezvous;
use crate::signaling::{self, JoinRequest, VoiceSession, VoiceSettings};
use crate::VoiceError;

const CLOSE_NORMAL: u16 = 1000;
const PACKET_QUEUE_CAPACITY: usize = 256;

type VoiceSink = SplitSink<WsFramed, Frame>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceStatus {
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected,
    Failed(String),
}

impl VoiceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, VoiceStatus::Disconnected | VoiceStatus::Failed(_))
    }
}

/// Cloneable handle to one guild's voice connection.
#[derive(Clone)]
pub struct VoiceHandle {
    request: JoinRequest,
    pipeline: PipelineHandle,
    status: watch::Receiver<VoiceStatus>,
    ssrc: watch::Receiver<u32>,
    speakers: Arc<DashMap<u32, Snowflake>>,
    packets: Arc<Mutex<Option<mpsc::Receiver<VoicePacket>>>>,
    cancel: CancellationToken,
}

impl VoiceHandle {
    pub fn request(&self) -> JoinRequest {
        self.request
    }

    pub fn guild_id(&self) -> Snowflake {
        self.request.guild_id
    }

    pub fn channel_id(&self) -> Snowflake {
        self.request.channel_id
    }

    pub fn pipeline(&self) -> &PipelineHandle {
        &self.pipeline
    }

    pub fn status(&self) -> VoiceStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<VoiceStatus> {
        self.status.clone()
    }

    /// Our SSRC on the current session.
    pub fn ssrc(&self) -> u32 {
        *self.ssrc.borrow()
    }

    pub fn user_for_ssrc(&self, ssrc: u32) -> Option<Snowflake> {
        self.speakers.get(&ssrc).map(|user| *user)
    }

    /// Decoded inbound voice, when receiving was enabled. Only the first
    /// caller gets the receiver.
    pub async fn take_voice_receiver(&self) -> Option<mpsc::Receiver<VoicePacket>> {
        self.packets.lock().await.take()
    }

    /// Leave the channel and stop all tasks.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.status.borrow().is_terminal()
    }

    /// Wait until the connection has ended and return how.
    pub async fn closed(&self) -> VoiceStatus {
        let mut status = self.status.clone();
        let result = match status.wait_for(VoiceStatus::is_terminal).await {
            Ok(status) => status.clone(),
            Err(_) => VoiceStatus::Disconnected,
        };
        result
    }
}

enum DriveEnd {
    Shutdown,
    Lost,
    Fatal(VoiceError),
}

/// Task owning one guild's voice socket across reconnects.
pub struct VoiceConnection {
    request: JoinRequest,
    gateway: GatewayHandle,
    rendezvous: Arc<VoiceRendezvous>,
    settings: VoiceSettings,
    pipeline: PipelineHandle,
    speaking: watch::Receiver<bool>,
    status: watch::Sender<VoiceStatus>,
    ssrc: watch::Sender<u32>,
    speakers: Arc<DashMap<u32, Snowflake>>,
    packets: Option<mpsc::Sender<VoicePacket>>,
    reconnect: ReconnectState,
    cancel: CancellationToken,
}

impl VoiceConnection {
    /// Join a channel. Signaling failures are returned here; failures after
    /// the join are retried and finally reported through the handle.
    pub async fn join(
        gateway: GatewayHandle,
        rendezvous: Arc<VoiceRendezvous>,
        request: JoinRequest,
        settings: VoiceSettings,
    ) -> Result<VoiceHandle, VoiceError> {
        let session = signaling::establish(&gateway, &rendezvous, request, &settings).await?;
        let (pipeline, speaking) =
            AudioPipeline::spawn(session.sender()?, settings.pipeline.clone())?;

        let (status_tx, status_rx) = watch::channel(VoiceStatus::Connected);
        let (ssrc_tx, ssrc_rx) = watch::channel(session.ssrc);
        let speakers = Arc::new(DashMap::new());
        let (packets_tx, packets_rx) = if settings.receive {
            let (tx, rx) = mpsc::channel(PACKET_QUEUE_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let cancel = CancellationToken::new();

        let handle = VoiceHandle {
            request,
            pipeline: pipeline.clone(),
            status: status_rx,
            ssrc: ssrc_rx,
            speakers: Arc::clone(&speakers),
            packets: Arc::new(Mutex::new(packets_rx)),
            cancel: cancel.clone(),
        };
        let connection = Self {
            request,
            gateway,
            rendezvous,
            reconnect: ReconnectState::new(settings.policy.clone()),
            settings,
            pipeline,
            speaking,
            status: status_tx,
            ssrc: ssrc_tx,
            speakers,
            packets: packets_tx,
            cancel,
        };
        tokio::spawn(connection.run(session));
        Ok(handle)
    }

    async fn run(mut self, first: VoiceSession) {
        let guild_id = self.request.guild_id;
        let mut session = first;
        let result = loop {
            match self.drive(session).await {
                DriveEnd::Shutdown => break Ok(()),
                DriveEnd::Fatal(e) => break Err(e),
                DriveEnd::Lost => match self.reestablish().await {
                    Ok(Some(next)) => session = next,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
            }
        };

        self.pipeline.shutdown();
        if let Err(e) = self
            .gateway
            .update_voice_state(guild_id, None, self.settings.self_mute, self.settings.self_deaf)
            .await
        {
            tracing::debug!(%guild_id, error = %e, "could not send voice leave");
        }

        let status = match result {
            Ok(()) => {
                tracing::info!(%guild_id, "voice disconnected");
                VoiceStatus::Disconnected
            }
            Err(e) => {
                tracing::error!(%guild_id, error = %e, "voice connection failed");
                VoiceStatus::Failed(e.to_string())
            }
        };
        self.cancel.cancel();
        self.status.send_replace(status);
    }

    /// Re-run signaling until a session is up, the policy gives out, or we
    /// are cancelled (`Ok(None)`).
    async fn reestablish(&mut self) -> Result<Option<VoiceSession>, VoiceError> {
        let guild_id = self.request.guild_id;
        loop {
            let Some(delay) = self.reconnect.next_delay() else {
                return Err(VoiceError::ReconnectsExhausted {
                    attempts: self.reconnect.attempts(),
                });
            };
            let attempt = self.reconnect.attempts();
            self.status.send_replace(VoiceStatus::Reconnecting { attempt });
            tracing::info!(%guild_id, attempt, delay_ms = delay.as_millis() as u64, "voice reconnecting");

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
            let established = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                result = signaling::establish(&self.gateway, &self.rendezvous, self.request, &self.settings) => result,
            };

            let session = match established {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(%guild_id, attempt, error = %e, "voice reconnect attempt failed");
                    continue;
                }
            };
            match session.sender() {
                Ok(sender) => self.pipeline.rebind(sender),
                Err(e) => {
                    tracing::warn!(%guild_id, error = %e, "voice session key rejected");
                    continue;
                }
            }
            self.reconnect.reset();
            return Ok(Some(session));
        }
    }

    async fn drive(&mut self, session: VoiceSession) -> DriveEnd {
        let guild_id = self.request.guild_id;
        let ssrc = session.ssrc;
        self.ssrc.send_replace(ssrc);
        self.speakers.clear();
        self.status.send_replace(VoiceStatus::Connected);

        let receiver_cancel = self.cancel.child_token();
        let _receiver_guard = receiver_cancel.clone().drop_guard();
        if let Some(out) = &self.packets {
            match session.sealer() {
                Ok(opener) => {
                    spawn_receiver(
                        Arc::clone(&session.socket),
                        opener,
                        Arc::clone(&self.speakers),
                        out.clone(),
                        receiver_cancel,
                    );
                }
                Err(e) => tracing::warn!(%guild_id, error = %e, "voice receive disabled"),
            }
        }

        let mut heartbeat = session.heartbeat;
        let (mut tx, mut rx) = session.framed.split::<Frame>();
        let mut last_nonce = None;
        let mut speaking_open = true;

        let speaking_now = *self.speaking.borrow_and_update();
        if speaking_now && send(&mut tx, &speaking(true, ssrc)).await.is_err() {
            return DriveEnd::Lost;
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = tx.send(Frame::close(CLOSE_NORMAL, "leaving")).await;
                    return DriveEnd::Shutdown;
                }
                changed = self.speaking.changed(), if speaking_open => {
                    if changed.is_err() {
                        speaking_open = false;
                        continue;
                    }
                    let on = *self.speaking.borrow_and_update();
                    if send(&mut tx, &speaking(on, ssrc)).await.is_err() {
                        return DriveEnd::Lost;
                    }
                }
                _ = tokio::time::sleep_until(heartbeat.deadline()) => match heartbeat.on_tick() {
                    Beat::Send => {
                        let nonce = u64::from(rand::random::<u32>());
                        last_nonce = Some(nonce);
                        if send(&mut tx, &VoiceMessage::heartbeat(nonce)).await.is_err() {
                            return DriveEnd::Lost;
                        }
                    }
                    Beat::Missed => {
                        tracing::warn!(%guild_id, since_ack = ?heartbeat.since_last_ack(), "voice heartbeat ack missed");
                        return DriveEnd::Lost;
                    }
                },
                frame = rx.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            tracing::warn!(%guild_id, error = %e, "voice read failed");
                            return DriveEnd::Lost;
                        }
                        None => {
                            tracing::warn!(%guild_id, "voice socket ended");
                            return DriveEnd::Lost;
                        }
                    };
                    match frame.opcode {
                        OpCode::Text | OpCode::Binary => {
                            if let Some(text) = frame.as_text() {
                                self.on_payload(text, &mut heartbeat, last_nonce);
                            }
                        }
                        OpCode::Ping => {
                            if tx.send(Frame::pong(frame.payload.clone())).await.is_err() {
                                return DriveEnd::Lost;
                            }
                        }
                        OpCode::Close => {
                            let code = frame.close_code();
                            wire_log_close(Channel::Voice, code, frame.close_reason().unwrap_or(""));
                            return classify_close(code);
                        }
                        OpCode::Pong | OpCode::Continuation => {}
                    }
                }
            }
        }
    }

    fn on_payload(&self, text: &str, heartbeat: &mut HeartbeatSupervisor, last_nonce: Option<u64>) {
        let message: VoiceMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed voice payload");
                return;
            }
        };
        wire_log_in(Channel::Voice, Some(message.op), text);

        match message.op {
            VOICE_OP_HEARTBEAT_ACK => {
                let echoed = message.d.as_u64();
                if echoed.is_some() && echoed != last_nonce {
                    tracing::debug!(?echoed, expected = ?last_nonce, "voice heartbeat ack nonce mismatch");
                }
                if let Some(latency) = heartbeat.on_ack() {
                    tracing::debug!(latency_ms = latency.as_millis() as u64, "voice heartbeat ack");
                }
            }
            VOICE_OP_SPEAKING => {
                if let Some(update) = message.data::<SpeakingUpdate>() {
                    tracing::debug!(ssrc = update.ssrc, user_id = %update.user_id, "speaker mapped");
                    self.speakers.insert(update.ssrc, update.user_id);
                }
            }
            VOICE_OP_CLIENT_DISCONNECT => {
                if let Some(gone) = message.data::<ClientDisconnect>() {
                    self.speakers.retain(|_, user| *user != gone.user_id);
                    tracing::debug!(user_id = %gone.user_id, "speaker left");
                }
            }
            op => tracing::debug!(op, "ignoring voice opcode"),
        }
    }
}

fn speaking(on: bool, ssrc: u32) -> VoiceMessage {
    let flags = if on { SPEAKING_MICROPHONE } else { 0 };
    VoiceMessage {
        op: VOICE_OP_SPEAKING,
        d: serde_json::to_value(Speaking {
            speaking: flags,
            delay: 0,
            ssrc,
        })
        .unwrap_or(Value::Null),
    }
}

async fn send(tx: &mut VoiceSink, message: &VoiceMessage) -> Result<(), VoiceError> {
    let payload = serde_json::to_string(message)?;
    wire_log_out(Channel::Voice, message.op, &payload);
    tx.send(Frame::text(payload))
        .await
        .map_err(|_| VoiceError::Closed { code: None })
}

fn classify_close(code: Option<u16>) -> DriveEnd {
    match code {
        Some(
            code @ (VOICE_CLOSE_AUTHENTICATION_FAILED
            | VOICE_CLOSE_DISCONNECTED
            | VOICE_CLOSE_UNKNOWN_ENCRYPTION_MODE),
        ) => DriveEnd::Fatal(VoiceError::Closed { code: Some(code) }),
        code => {
            tracing::warn!(?code, "voice socket closed");
            DriveEnd::Lost
        }
    }
}
