use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use cadence_models::gateway::{
    GatewayMessage, Hello, Identify, Ready, VoiceStateUpdate, CLOSE_AUTHENTICATION_FAILED,
    CLOSE_DISALLOWED_INTENTS, CLOSE_INVALID_API_VERSION, CLOSE_INVALID_INTENTS,
    CLOSE_INVALID_SEQ, CLOSE_INVALID_SHARD, CLOSE_SESSION_TIMED_OUT, CLOSE_SHARDING_REQUIRED,
    CLOSE_UNKNOWN_ERROR, EVENT_READY, EVENT_RESUMED, OP_DISPATCH, OP_HEARTBEAT,
    OP_HEARTBEAT_ACK, OP_HELLO, OP_INVALID_SESSION, OP_RECONNECT, OP_VOICE_STATE_UPDATE,
};
use cadence_models::gateway::ConnectionProperties;
use cadence_models::snowflake::snowflake_field;
use cadence_models::{GatewayIntents, Snowflake};
use cadence_ws::wire::{wire_log_close, wire_log_in, wire_log_out, Channel};
use cadence_ws::{connect, Beat, ConnectSettings, Frame, HeartbeatSupervisor, OpCode, WsFramed};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::{gateway_url, DEFAULT_GATEWAY_URL};
use crate::reconnect::{ReconnectPolicy, ReconnectState};
use crate::session::ConnectionSession;
use crate::GatewayError;

const COMMAND_QUEUE_CAPACITY: usize = 256;
const OUTBOX_CAPACITY: usize = 64;
const CLOSE_NORMAL: u16 = 1000;

type WsSink = SplitSink<WsFramed, Frame>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Connecting,
    AwaitingHello,
    Identifying,
    Resuming,
    Connected,
    Closing,
    Terminated,
}

/// Identity learned from READY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: Snowflake,
}

/// Receives every dispatch in arrival order.
pub trait DispatchSink: Send + Sync + 'static {
    fn on_dispatch(&self, event: &str, payload: &Value);
}

impl<F> DispatchSink for F
where
    F: Fn(&str, &Value) + Send + Sync + 'static,
{
    fn on_dispatch(&self, event: &str, payload: &Value) {
        self(event, payload)
    }
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub url: String,
    pub token: String,
    pub intents: GatewayIntents,
    pub shard: Option<[u32; 2]>,
    pub presence: Option<Value>,
    pub large_threshold: Option<u16>,
    pub policy: ReconnectPolicy,
    pub connect: ConnectSettings,
    /// How long a fresh socket may stay silent before Hello.
    pub hello_timeout: Duration,
}

impl GatewaySettings {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            token: token.into(),
            intents: GatewayIntents::default(),
            shard: None,
            presence: None,
            large_threshold: None,
            policy: ReconnectPolicy::default(),
            connect: ConnectSettings::default(),
            hello_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

/// How a socket session ended.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Fatal(u16),
    Reconnect { resume: bool, wait: Wait },
}

#[derive(Debug, Clone, Copy)]
enum Wait {
    Backoff,
    Immediate,
    InvalidSession,
}

impl SessionEnd {
    fn transport() -> Self {
        SessionEnd::Reconnect {
            resume: true,
            wait: Wait::Backoff,
        }
    }
}

/// Cloneable command side of a running [`GatewayConnection`].
#[derive(Clone)]
pub struct GatewayHandle {
    commands: mpsc::Sender<GatewayMessage>,
    state: watch::Receiver<GatewayState>,
    info: watch::Receiver<Option<SessionInfo>>,
    cancel: CancellationToken,
}

impl GatewayHandle {
    /// Queue a payload. Held back until the session is authenticated.
    pub async fn send(&self, message: GatewayMessage) -> Result<(), GatewayError> {
        self.commands
            .send(message)
            .await
            .map_err(|_| GatewayError::Closed)
    }

    pub async fn update_voice_state(
        &self,
        guild_id: Snowflake,
        channel_id: Option<Snowflake>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), GatewayError> {
        let message = GatewayMessage::voice_state_update(&VoiceStateUpdate {
            guild_id,
            channel_id,
            self_mute,
            self_deaf,
        })?;
        self.send(message).await
    }

    /// Close with 1000 and stop reconnecting.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> GatewayState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<GatewayState> {
        self.state.clone()
    }

    pub fn current_user(&self) -> Option<Snowflake> {
        self.info.borrow().as_ref().map(|i| i.user_id)
    }

    pub fn session_id(&self) -> Option<String> {
        self.info.borrow().as_ref().map(|i| i.session_id.clone())
    }

    /// Wait for the first READY and return our user id.
    pub async fn wait_ready(&self) -> Result<Snowflake, GatewayError> {
        let mut info = self.info.clone();
        let current = info
            .wait_for(Option::is_some)
            .await
            .map_err(|_| GatewayError::Closed)?;
        current
            .as_ref()
            .map(|i| i.user_id)
            .ok_or(GatewayError::Closed)
    }
}

/// Single task owning the gateway socket across reconnects.
pub struct GatewayConnection {
    settings: GatewaySettings,
    sink: Arc<dyn DispatchSink>,
    commands: mpsc::Receiver<GatewayMessage>,
    commands_open: bool,
    outbox: VecDeque<GatewayMessage>,
    state: watch::Sender<GatewayState>,
    info: watch::Sender<Option<SessionInfo>>,
    session: ConnectionSession,
    reconnect: ReconnectState,
    cancel: CancellationToken,
}

impl GatewayConnection {
    pub fn new(settings: GatewaySettings, sink: Arc<dyn DispatchSink>) -> (Self, GatewayHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(GatewayState::Connecting);
        let (info_tx, info_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let reconnect = ReconnectState::new(settings.policy.clone());
        let handle = GatewayHandle {
            commands: command_tx,
            state: state_rx,
            info: info_rx,
            cancel: cancel.clone(),
        };
        let connection = Self {
            settings,
            sink,
            commands: command_rx,
            commands_open: true,
            outbox: VecDeque::new(),
            state: state_tx,
            info: info_tx,
            session: ConnectionSession::new(),
            reconnect,
            cancel,
        };
        (connection, handle)
    }

    /// Connect and keep the session alive until shutdown or a terminal failure.
    pub async fn run(mut self) -> Result<(), GatewayError> {
        let result = self.run_inner().await;
        self.set_state(GatewayState::Terminated);
        result
    }

    async fn run_inner(&mut self) -> Result<(), GatewayError> {
        let cancel = self.cancel.clone();
        loop {
            self.set_state(GatewayState::Connecting);
            let url = self.connect_url();
            let connected = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = connect(&url, self.settings.connect) => result,
            };

            let end = match connected {
                Ok(framed) => {
                    tracing::info!(%url, resume = self.session.is_resumable(), "gateway socket open");
                    self.drive(framed).await
                }
                Err(e) => {
                    tracing::warn!(%url, error = %e, "gateway connect failed");
                    SessionEnd::transport()
                }
            };

            let (resume, wait) = match end {
                SessionEnd::Shutdown => return Ok(()),
                SessionEnd::Fatal(code) => {
                    tracing::error!(code, "gateway closed with fatal code");
                    return Err(GatewayError::FatalClose { code });
                }
                SessionEnd::Reconnect { resume, wait } => (resume, wait),
            };

            if !resume {
                self.session.reset();
            }

            let Some(backoff) = self.reconnect.next_delay() else {
                let attempts = self.reconnect.attempts();
                tracing::error!(attempts, "gateway reconnect attempts exhausted");
                return Err(GatewayError::ReconnectsExhausted { attempts });
            };
            let delay = match wait {
                Wait::Backoff => backoff,
                Wait::Immediate => Duration::ZERO,
                Wait::InvalidSession => self.reconnect.policy().invalid_session_delay(),
            };
            tracing::info!(
                attempt = self.reconnect.attempts(),
                delay_ms = delay.as_millis() as u64,
                resume = self.session.is_resumable(),
                "gateway reconnecting"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn connect_url(&self) -> String {
        match (&self.session.resume_url, self.session.is_resumable()) {
            (Some(url), true) => gateway_url(url),
            _ => self.settings.url.clone(),
        }
    }

    fn set_state(&self, state: GatewayState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, ?state, "gateway state");
        }
    }

    fn current_state(&self) -> GatewayState {
        *self.state.borrow()
    }

    async fn drive(&mut self, framed: WsFramed) -> SessionEnd {
        let (mut tx, mut rx) = framed.split::<Frame>();
        let cancel = self.cancel.clone();
        let mut heartbeat: Option<HeartbeatSupervisor> = None;
        let hello_deadline = Instant::now() + self.settings.hello_timeout;
        self.set_state(GatewayState::AwaitingHello);

        loop {
            let deadline = heartbeat
                .as_ref()
                .map_or(hello_deadline, HeartbeatSupervisor::deadline);

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_state(GatewayState::Closing);
                    let _ = tx.send(Frame::close(CLOSE_NORMAL, "shutdown")).await;
                    return SessionEnd::Shutdown;
                }
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(message) if self.current_state() == GatewayState::Connected => {
                        if self.send(&mut tx, &message).await.is_err() {
                            return SessionEnd::transport();
                        }
                    }
                    Some(message) => self.hold(message),
                    None => self.commands_open = false,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    let Some(hb) = heartbeat.as_mut() else {
                        tracing::warn!(timeout = ?self.settings.hello_timeout, "no hello from gateway");
                        return SessionEnd::transport();
                    };
                    match hb.on_tick() {
                        Beat::Send => {
                            let beat = GatewayMessage::heartbeat(self.session.sequence);
                            if self.send(&mut tx, &beat).await.is_err() {
                                return SessionEnd::transport();
                            }
                        }
                        Beat::Missed => {
                            tracing::warn!(since_ack = ?hb.since_last_ack(), "heartbeat ack missed, forcing reconnect");
                            let _ = tx.send(Frame::close(CLOSE_UNKNOWN_ERROR, "heartbeat ack missed")).await;
                            return SessionEnd::Reconnect {
                                resume: true,
                                wait: Wait::Immediate,
                            };
                        }
                    }
                }
                frame = rx.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "gateway read failed");
                            return SessionEnd::transport();
                        }
                        None => {
                            tracing::warn!("gateway stream ended");
                            return SessionEnd::transport();
                        }
                    };
                    if let Some(end) = self.handle_frame(frame, &mut tx, &mut heartbeat).await {
                        return end;
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        frame: Frame,
        tx: &mut WsSink,
        heartbeat: &mut Option<HeartbeatSupervisor>,
    ) -> Option<SessionEnd> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                let Some(text) = frame.as_text() else {
                    tracing::warn!(bytes = frame.payload.len(), "non-utf8 gateway payload dropped");
                    return None;
                };
                self.handle_payload(text, tx, heartbeat).await
            }
            OpCode::Ping => match tx.send(Frame::pong(frame.payload.clone())).await {
                Ok(()) => None,
                Err(_) => Some(SessionEnd::transport()),
            },
            OpCode::Close => {
                let code = frame.close_code();
                let reason = frame.close_reason().unwrap_or("");
                wire_log_close(Channel::Gateway, code, reason);
                Some(classify_close(code, reason))
            }
            OpCode::Pong | OpCode::Continuation => None,
        }
    }

    async fn handle_payload(
        &mut self,
        text: &str,
        tx: &mut WsSink,
        heartbeat: &mut Option<HeartbeatSupervisor>,
    ) -> Option<SessionEnd> {
        let message: GatewayMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed gateway payload");
                return None;
            }
        };
        wire_log_in(Channel::Gateway, Some(message.op), text);

        match message.op {
            OP_HELLO => {
                let Some(hello) = message.data::<Hello>() else {
                    tracing::warn!("hello without heartbeat interval");
                    return None;
                };
                let interval = Duration::from_millis(hello.heartbeat_interval);
                tracing::info!(interval_ms = hello.heartbeat_interval, "gateway hello");
                *heartbeat = Some(HeartbeatSupervisor::new(interval));
                self.session.heartbeat_interval = Some(interval);

                let handshake = match self.session.resume_payload(&self.settings.token) {
                    Some(resume) => {
                        self.set_state(GatewayState::Resuming);
                        GatewayMessage::resume(&resume)
                    }
                    None => {
                        self.set_state(GatewayState::Identifying);
                        GatewayMessage::identify(&self.identify_payload())
                    }
                };
                match handshake {
                    Ok(message) => {
                        if self.send(tx, &message).await.is_err() {
                            return Some(SessionEnd::transport());
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "failed to encode handshake"),
                }
                None
            }
            OP_DISPATCH => self.on_dispatch(&message, tx).await,
            OP_HEARTBEAT => {
                if let Some(hb) = heartbeat.as_mut() {
                    hb.beat_now();
                }
                let beat = GatewayMessage::heartbeat(self.session.sequence);
                match self.send(tx, &beat).await {
                    Ok(()) => None,
                    Err(_) => Some(SessionEnd::transport()),
                }
            }
            OP_HEARTBEAT_ACK => {
                if let Some(latency) = heartbeat.as_mut().and_then(HeartbeatSupervisor::on_ack) {
                    tracing::debug!(latency_ms = latency.as_millis() as u64, "heartbeat ack");
                }
                None
            }
            OP_RECONNECT => {
                tracing::info!("gateway requested reconnect");
                Some(SessionEnd::Reconnect {
                    resume: true,
                    wait: Wait::Immediate,
                })
            }
            OP_INVALID_SESSION => {
                let resumable = message.d.as_ref().and_then(Value::as_bool).unwrap_or(false);
                tracing::warn!(resumable, "invalid session");
                Some(SessionEnd::Reconnect {
                    resume: resumable,
                    wait: Wait::InvalidSession,
                })
            }
            op => {
                tracing::debug!(op, "ignoring unknown gateway opcode");
                None
            }
        }
    }

    async fn on_dispatch(&mut self, message: &GatewayMessage, tx: &mut WsSink) -> Option<SessionEnd> {
        let Some(event) = message.t.as_deref() else {
            tracing::warn!(seq = ?message.s, "dispatch without event name");
            return None;
        };
        if let Some(seq) = message.s {
            if !self.session.observe_sequence(seq) {
                tracing::warn!(seq, last = ?self.session.sequence, event, "sequence regression, dispatch discarded");
                return None;
            }
        }

        let authenticated = match event {
            EVENT_READY => {
                match message.data::<Ready>() {
                    Some(ready) => {
                        self.session.on_ready(&ready);
                        self.info.send_replace(Some(SessionInfo {
                            session_id: ready.session_id.clone(),
                            user_id: ready.user.id,
                        }));
                        tracing::info!(user_id = %ready.user.id, session_id = %ready.session_id, "gateway ready");
                    }
                    None => tracing::warn!("READY payload missing session fields"),
                }
                true
            }
            EVENT_RESUMED => {
                tracing::info!(seq = ?self.session.sequence, "gateway resumed");
                true
            }
            _ => false,
        };

        let payload = message.d.as_ref().unwrap_or(&Value::Null);
        self.sink.on_dispatch(event, payload);

        if authenticated {
            self.set_state(GatewayState::Connected);
            self.reconnect.reset();
            while let Some(queued) = self.outbox.pop_front() {
                if self.send(tx, &queued).await.is_err() {
                    self.outbox.push_front(queued);
                    return Some(SessionEnd::transport());
                }
            }
        }
        None
    }

    /// Park a command until the session is authenticated. A newer voice state
    /// update for a guild replaces the queued one, and the oldest entry is
    /// dropped once the queue is full.
    fn hold(&mut self, message: GatewayMessage) {
        if message.op == OP_VOICE_STATE_UPDATE {
            let guild = voice_state_guild(&message);
            self.outbox.retain(|queued| {
                queued.op != OP_VOICE_STATE_UPDATE || voice_state_guild(queued) != guild
            });
        }
        if self.outbox.len() >= OUTBOX_CAPACITY {
            if let Some(dropped) = self.outbox.pop_front() {
                tracing::warn!(op = dropped.op, "gateway outbox full, dropping oldest command");
            }
        }
        self.outbox.push_back(message);
    }

    fn identify_payload(&self) -> Identify {
        Identify {
            token: self.settings.token.clone(),
            intents: self.settings.intents,
            properties: ConnectionProperties::default(),
            shard: self.settings.shard,
            presence: self.settings.presence.clone(),
            large_threshold: self.settings.large_threshold,
        }
    }

    async fn send(&self, tx: &mut WsSink, message: &GatewayMessage) -> Result<(), GatewayError> {
        let payload = serde_json::to_string(message)?;
        wire_log_out(Channel::Gateway, message.op, &payload);
        tx.send(Frame::text(payload)).await.map_err(|e| {
            tracing::warn!(error = %e, op = message.op, "gateway write failed");
            GatewayError::Closed
        })
    }
}

fn voice_state_guild(message: &GatewayMessage) -> Option<Snowflake> {
    message
        .d
        .as_ref()
        .and_then(|d| snowflake_field(d, "guild_id"))
}

fn classify_close(code: Option<u16>, reason: &str) -> SessionEnd {
    match code {
        Some(
            code @ (CLOSE_AUTHENTICATION_FAILED
            | CLOSE_INVALID_SHARD
            | CLOSE_SHARDING_REQUIRED
            | CLOSE_INVALID_API_VERSION
            | CLOSE_INVALID_INTENTS
            | CLOSE_DISALLOWED_INTENTS),
        ) => SessionEnd::Fatal(code),
        Some(code @ (CLOSE_INVALID_SEQ | CLOSE_SESSION_TIMED_OUT)) => {
            tracing::warn!(code, reason, "gateway session expired, identifying fresh");
            SessionEnd::Reconnect {
                resume: false,
                wait: Wait::Backoff,
            }
        }
        code => {
            tracing::warn!(code = ?code, reason, "gateway closed");
            SessionEnd::transport()
        }
    }
}
