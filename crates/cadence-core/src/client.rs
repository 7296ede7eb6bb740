use std::sync::Arc;
use std::time::Duration;

use cadence_gateway::{
    DispatchSink, GatewayConnection, GatewayError, GatewayHandle, GatewaySettings, GatewayState,
};
use cadence_models::Snowflake;
use cadence_voice::{JoinRequest, VoiceConnection, VoiceHandle, VoiceRendezvous, VoiceSettings};
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::correlator::{Correlator, CorrelatorSettings};
use crate::error::CoreError;
use crate::events::{EventBus, GatewayEvent};
use crate::responder::InteractionResponder;
use crate::router::DispatchRouter;

/// How long `leave_voice` and `shutdown` wait for a voice task to wind down.
const VOICE_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub gateway: GatewaySettings,
    pub voice: VoiceSettings,
    pub correlator: CorrelatorSettings,
    pub event_capacity: usize,
}

impl ClientSettings {
    pub fn new(gateway: GatewaySettings) -> Self {
        Self {
            gateway,
            voice: VoiceSettings::default(),
            correlator: CorrelatorSettings::default(),
            event_capacity: 4096,
        }
    }
}

/// Owns one gateway session and everything hanging off it.
pub struct Client {
    gateway: GatewayHandle,
    task: Mutex<Option<JoinHandle<Result<(), GatewayError>>>>,
    bus: EventBus,
    correlator: Arc<Correlator>,
    rendezvous: Arc<VoiceRendezvous>,
    voice: DashMap<Snowflake, VoiceHandle>,
    settings: ClientSettings,
}

impl Client {
    /// Spawn the gateway connection and wire its dispatches into the client.
    pub fn start(
        settings: ClientSettings,
        responder: Arc<dyn InteractionResponder>,
        sink: Option<Arc<dyn DispatchSink>>,
    ) -> Arc<Self> {
        let bus = EventBus::new(settings.event_capacity);
        let correlator = Correlator::new(settings.correlator.clone(), responder);
        let rendezvous = VoiceRendezvous::new();
        let router = DispatchRouter::new(
            bus.clone(),
            Arc::clone(&correlator),
            Arc::clone(&rendezvous),
            sink,
        );

        let (connection, gateway) = GatewayConnection::new(settings.gateway.clone(), Arc::new(router));
        let task = tokio::spawn(connection.run());
        tracing::info!(intents = ?settings.gateway.intents, "client started");

        Arc::new(Self {
            gateway,
            task: Mutex::new(Some(task)),
            bus,
            correlator,
            rendezvous,
            voice: DashMap::new(),
            settings,
        })
    }

    pub fn gateway(&self) -> &GatewayHandle {
        &self.gateway
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.bus.subscribe()
    }

    /// Resolves with our user id once READY has been received.
    pub async fn wait_ready(&self) -> Result<Snowflake, CoreError> {
        Ok(self.gateway.wait_ready().await?)
    }

    /// Live voice connection for `guild_id`, if any.
    pub fn voice(&self, guild_id: Snowflake) -> Option<VoiceHandle> {
        self.voice
            .get(&guild_id)
            .map(|handle| handle.clone())
            .filter(|handle| !handle.is_closed())
    }

    /// Join `channel_id`. Joining the channel we are already in returns the
    /// existing connection; joining another channel in the same guild ends
    /// the old connection first.
    pub async fn join_voice(
        &self,
        guild_id: Snowflake,
        channel_id: Snowflake,
    ) -> Result<VoiceHandle, CoreError> {
        if let Some(existing) = self.voice(guild_id) {
            if existing.channel_id() == channel_id {
                return Ok(existing);
            }
            tracing::info!(%guild_id, from = %existing.channel_id(), to = %channel_id, "moving voice channel");
            self.close_voice(&existing).await;
        }
        self.voice.remove_if(&guild_id, |_, handle| handle.is_closed());

        let request = JoinRequest {
            guild_id,
            channel_id,
        };
        let handle = VoiceConnection::join(
            self.gateway.clone(),
            Arc::clone(&self.rendezvous),
            request,
            self.settings.voice.clone(),
        )
        .await?;
        if let Some(previous) = self.voice.insert(guild_id, handle.clone()) {
            // A concurrent join for the same guild finished first.
            previous.disconnect();
        }
        tracing::info!(%guild_id, %channel_id, ssrc = handle.ssrc(), "voice joined");
        Ok(handle)
    }

    /// Leave voice in `guild_id`. Returns false if we were not connected.
    pub async fn leave_voice(&self, guild_id: Snowflake) -> bool {
        let Some((_, handle)) = self.voice.remove(&guild_id) else {
            return false;
        };
        self.close_voice(&handle).await;
        true
    }

    async fn close_voice(&self, handle: &VoiceHandle) {
        handle.disconnect();
        match tokio::time::timeout(VOICE_CLOSE_TIMEOUT, handle.closed()).await {
            Ok(status) => {
                tracing::info!(guild_id = %handle.guild_id(), ?status, "voice closed")
            }
            Err(_) => tracing::warn!(guild_id = %handle.guild_id(), "voice close timed out"),
        }
    }

    /// Resolves when the gateway connection has terminated, for whatever
    /// reason.
    pub async fn closed(&self) {
        let mut state = self.gateway.watch_state();
        let _ = state.wait_for(|s| *s == GatewayState::Terminated).await;
    }

    /// Leave every voice channel, cancel pending waits, close the gateway and
    /// report how its task ended.
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        let guilds: Vec<Snowflake> = self.voice.iter().map(|entry| *entry.key()).collect();
        for guild_id in guilds {
            self.leave_voice(guild_id).await;
        }
        self.correlator.cancel_all();
        self.gateway.shutdown();

        let task = self.task.lock().await.take();
        let Some(task) = task else {
            return Ok(());
        };
        let result = task.await.map_err(|e| CoreError::Task(e.to_string()))?;
        tracing::info!("client stopped");
        Ok(result?)
    }
}
