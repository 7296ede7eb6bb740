use std::sync::Arc;

use cadence_gateway::DispatchSink;
use cadence_models::gateway::{
    EVENT_INTERACTION_CREATE, EVENT_VOICE_SERVER_UPDATE, EVENT_VOICE_STATE_UPDATE,
};
use cadence_models::interaction::Interaction;
use cadence_voice::VoiceRendezvous;
use serde_json::Value;

use crate::correlator::Correlator;
use crate::events::EventBus;

/// Fans each dispatch out to the bus, the correlator, the voice rendezvous
/// and an optional application sink, in that order.
pub struct DispatchRouter {
    bus: EventBus,
    correlator: Arc<Correlator>,
    rendezvous: Arc<VoiceRendezvous>,
    sink: Option<Arc<dyn DispatchSink>>,
}

impl DispatchRouter {
    pub fn new(
        bus: EventBus,
        correlator: Arc<Correlator>,
        rendezvous: Arc<VoiceRendezvous>,
        sink: Option<Arc<dyn DispatchSink>>,
    ) -> Self {
        Self {
            bus,
            correlator,
            rendezvous,
            sink,
        }
    }
}

impl DispatchSink for DispatchRouter {
    fn on_dispatch(&self, event: &str, payload: &Value) {
        self.bus.dispatch(event, payload);

        match event {
            EVENT_INTERACTION_CREATE => match Interaction::from_value(payload) {
                Some(interaction) => {
                    let id = interaction.id;
                    if self.correlator.on_interaction(interaction) {
                        tracing::debug!(interaction_id = %id, "interaction claimed by waiter");
                    }
                }
                None => tracing::warn!("malformed INTERACTION_CREATE payload"),
            },
            EVENT_VOICE_STATE_UPDATE | EVENT_VOICE_SERVER_UPDATE => {
                self.rendezvous.on_dispatch(event, payload);
            }
            _ => {}
        }

        if let Some(sink) = &self.sink {
            sink.on_dispatch(event, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{CorrelatorSettings, Outcome, Wait};
    use cadence_models::Snowflake;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn fans_out_in_order() {
        let (tx, _rx) = mpsc::channel(4);
        let correlator = Correlator::new(CorrelatorSettings::default(), Arc::new(tx));
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink: Arc<dyn DispatchSink> = Arc::new({
            let seen = seen.clone();
            move |event: &str, _: &Value| seen.lock().unwrap().push(event.to_string())
        });
        let router = DispatchRouter::new(
            bus,
            correlator.clone(),
            VoiceRendezvous::new(),
            Some(sink),
        );

        let waiter = tokio::spawn({
            let correlator = correlator.clone();
            async move {
                correlator
                    .wait(Wait::new(Snowflake(10), Snowflake(20)).timeout(Duration::from_secs(5)))
                    .await
            }
        });
        while !correlator.is_waiting(Snowflake(10), Snowflake(20)) {
            tokio::task::yield_now().await;
        }

        router.on_dispatch("MESSAGE_CREATE", &json!({ "id": "1" }));
        router.on_dispatch(
            "INTERACTION_CREATE",
            &json!({
                "id": "2", "token": "t", "type": 3, "channel_id": "10",
                "message": { "id": "20" }, "user": { "id": "5" },
                "data": { "custom_id": "ok", "component_type": 2 }
            }),
        );

        assert!(matches!(waiter.await.unwrap(), Outcome::Matched(_)));
        assert_eq!(events.recv().await.unwrap().event_type, "MESSAGE_CREATE");
        assert_eq!(events.recv().await.unwrap().event_type, "INTERACTION_CREATE");
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["MESSAGE_CREATE".to_string(), "INTERACTION_CREATE".to_string()]
        );
    }
}
