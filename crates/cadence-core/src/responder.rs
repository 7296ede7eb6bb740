//! Outlets for interaction callbacks.

use cadence_models::interaction::InteractionResponse;
use cadence_models::Snowflake;
use tokio::sync::mpsc;

/// Sends an interaction callback without waiting for it to land.
pub trait InteractionResponder: Send + Sync + 'static {
    fn respond(&self, interaction_id: Snowflake, token: &str, response: InteractionResponse);
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingResponse {
    pub interaction_id: Snowflake,
    pub token: String,
    pub response: InteractionResponse,
}

/// Hands callbacks to whoever drains the channel.
impl InteractionResponder for mpsc::Sender<OutgoingResponse> {
    fn respond(&self, interaction_id: Snowflake, token: &str, response: InteractionResponse) {
        let outgoing = OutgoingResponse {
            interaction_id,
            token: token.to_string(),
            response,
        };
        if let Err(e) = self.try_send(outgoing) {
            tracing::warn!(%interaction_id, error = %e, "interaction response dropped");
        }
    }
}

/// Posts callbacks to `{api_base}/interactions/{id}/{token}/callback`.
#[derive(Debug, Clone)]
pub struct HttpResponder {
    http: reqwest::Client,
    api_base: String,
}

impl HttpResponder {
    pub fn new(http: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into(),
        }
    }

    pub fn callback_url(&self, interaction_id: Snowflake, token: &str) -> String {
        format!(
            "{}/interactions/{interaction_id}/{token}/callback",
            self.api_base.trim_end_matches('/')
        )
    }

    pub async fn post(
        &self,
        interaction_id: Snowflake,
        token: &str,
        response: &InteractionResponse,
    ) -> Result<(), reqwest::Error> {
        self.http
            .post(self.callback_url(interaction_id, token))
            .json(response)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl InteractionResponder for HttpResponder {
    fn respond(&self, interaction_id: Snowflake, token: &str, response: InteractionResponse) {
        let this = self.clone();
        let token = token.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.post(interaction_id, &token, &response).await {
                tracing::warn!(%interaction_id, error = %e, "interaction callback failed");
            }
        });
    }
}
