//! Pairs the two gateway dispatches that together describe a voice session.
//!
//! A join needs our voice session id (VOICE_STATE_UPDATE for our own user)
//! and the server assignment (VOICE_SERVER_UPDATE). They arrive in either
//! order; the registration completes once both are present.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence_gateway::DispatchSink;
use cadence_models::gateway::{
    VoiceServerEvent, VoiceStateEvent, EVENT_VOICE_SERVER_UPDATE, EVENT_VOICE_STATE_UPDATE,
};
use cadence_models::Snowflake;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::VoiceError;

/// Everything needed to open the voice socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceServerInfo {
    pub guild_id: Snowflake,
    pub user_id: Snowflake,
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

struct Pending {
    id: u64,
    user_id: Snowflake,
    session_id: Option<String>,
    server: Option<(String, String)>,
    done: Option<oneshot::Sender<VoiceServerInfo>>,
}

impl Pending {
    fn try_complete(&mut self, guild_id: Snowflake) {
        let (Some(session_id), Some((token, endpoint))) = (&self.session_id, &self.server) else {
            return;
        };
        if let Some(done) = self.done.take() {
            let _ = done.send(VoiceServerInfo {
                guild_id,
                user_id: self.user_id,
                session_id: session_id.clone(),
                token: token.clone(),
                endpoint: endpoint.clone(),
            });
        }
    }
}

#[derive(Default)]
pub struct VoiceRendezvous {
    pending: DashMap<Snowflake, Pending>,
    next_id: AtomicU64,
}

impl VoiceRendezvous {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start waiting for `guild`. Replaces any earlier registration for the
    /// same guild, whose waiter then fails with [`VoiceError::Superseded`].
    pub fn register(self: &Arc<Self>, guild_id: Snowflake, user_id: Snowflake) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            guild_id,
            Pending {
                id,
                user_id,
                session_id: None,
                server: None,
                done: Some(tx),
            },
        );
        Registration {
            rendezvous: Arc::clone(self),
            guild_id,
            id,
            rx: Some(rx),
        }
    }

    pub fn is_pending(&self, guild_id: Snowflake) -> bool {
        self.pending.contains_key(&guild_id)
    }

    pub fn on_voice_state(&self, event: &VoiceStateEvent) {
        let Some(guild_id) = event.guild_id else {
            return;
        };
        let Some(mut pending) = self.pending.get_mut(&guild_id) else {
            return;
        };
        if pending.user_id != event.user_id {
            return;
        }
        // Echo of the leave update sent before joining.
        if event.channel_id.is_none() {
            tracing::debug!(%guild_id, "ignoring voice state without channel");
            return;
        }
        tracing::debug!(%guild_id, session_id = %event.session_id, "voice state received");
        pending.session_id = Some(event.session_id.clone());
        pending.try_complete(guild_id);
    }

    pub fn on_voice_server(&self, event: &VoiceServerEvent) {
        let Some(mut pending) = self.pending.get_mut(&event.guild_id) else {
            return;
        };
        let Some(endpoint) = event.endpoint.as_deref().filter(|e| !e.is_empty()) else {
            tracing::debug!(guild_id = %event.guild_id, "voice server not allocated yet");
            return;
        };
        tracing::debug!(guild_id = %event.guild_id, endpoint, "voice server received");
        pending.server = Some((event.token.clone(), endpoint.to_string()));
        pending.try_complete(event.guild_id);
    }

    fn remove(&self, guild_id: Snowflake, id: u64) {
        self.pending.remove_if(&guild_id, |_, pending| pending.id == id);
    }
}

impl DispatchSink for VoiceRendezvous {
    fn on_dispatch(&self, event: &str, payload: &Value) {
        match event {
            EVENT_VOICE_STATE_UPDATE => {
                if let Ok(state) = serde_json::from_value::<VoiceStateEvent>(payload.clone()) {
                    self.on_voice_state(&state);
                }
            }
            EVENT_VOICE_SERVER_UPDATE => {
                if let Ok(server) = serde_json::from_value::<VoiceServerEvent>(payload.clone()) {
                    self.on_voice_server(&server);
                }
            }
            _ => {}
        }
    }
}

/// One in-flight join. Dropping it withdraws the registration unless a newer
/// one has taken its place.
pub struct Registration {
    rendezvous: Arc<VoiceRendezvous>,
    guild_id: Snowflake,
    id: u64,
    rx: Option<oneshot::Receiver<VoiceServerInfo>>,
}

impl Registration {
    pub async fn wait(mut self, timeout: Duration) -> Result<VoiceServerInfo, VoiceError> {
        let Some(rx) = self.rx.take() else {
            return Err(VoiceError::Superseded);
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(_)) => Err(VoiceError::Superseded),
            Err(_) => Err(VoiceError::RendezvousTimeout(timeout)),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.rendezvous.remove(self.guild_id, self.id);
    }
}
