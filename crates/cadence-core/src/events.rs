use cadence_models::Snowflake;
use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub event_type: String,
    pub payload: Value,
    /// Guild this event belongs to, if the payload names one.
    pub guild_id: Option<Snowflake>,
}

/// Broadcast-based event bus for gateway dispatches.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: GatewayEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Helper: publish a raw dispatch, lifting `guild_id` out of the payload.
    /// Skips the payload clone when nobody is listening.
    pub fn dispatch(&self, event_type: &str, payload: &Value) {
        if self.subscriber_count() == 0 {
            return;
        }
        let guild_id = cadence_models::snowflake::snowflake_field(payload, "guild_id");
        self.publish(GatewayEvent {
            event_type: event_type.to_string(),
            payload: payload.clone(),
            guild_id,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
