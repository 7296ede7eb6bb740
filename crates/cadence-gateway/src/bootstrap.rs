//! Gateway URL lookup over HTTP.

use serde::Deserialize;

use crate::GatewayError;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
pub const GATEWAY_QUERY: &str = "v=10&encoding=json";

#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    pub reset_after: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

fn default_max_concurrency() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBot {
    pub url: String,
    #[serde(default = "default_shards")]
    pub shards: u32,
    #[serde(default)]
    pub session_start_limit: Option<SessionStartLimit>,
}

fn default_shards() -> u32 {
    1
}

/// Append the protocol query unless the URL already carries one.
pub fn gateway_url(base: &str) -> String {
    if base.contains('?') {
        return base.to_string();
    }
    format!("{}/?{GATEWAY_QUERY}", base.trim_end_matches('/'))
}

/// `GET {api_base}/gateway/bot`. The returned URL already has the protocol query.
pub async fn fetch_gateway(
    http: &reqwest::Client,
    api_base: &str,
    token: &str,
) -> Result<GatewayBot, GatewayError> {
    let url = format!("{}/gateway/bot", api_base.trim_end_matches('/'));
    let mut bot: GatewayBot = http
        .get(&url)
        .header("Authorization", format!("Bot {token}"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    bot.url = gateway_url(&bot.url);
    tracing::info!(url = %bot.url, shards = bot.shards, "resolved gateway url");
    Ok(bot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_is_appended_once() {
        assert_eq!(
            gateway_url("wss://gateway.example.gg"),
            "wss://gateway.example.gg/?v=10&encoding=json"
        );
        assert_eq!(
            gateway_url("wss://gateway.example.gg/"),
            "wss://gateway.example.gg/?v=10&encoding=json"
        );
        assert_eq!(gateway_url(DEFAULT_GATEWAY_URL), DEFAULT_GATEWAY_URL);
    }

    #[test]
    fn parses_gateway_bot() {
        let bot: GatewayBot = serde_json::from_str(
            r#"{"url":"wss://g.example","shards":2,
                "session_start_limit":{"total":1000,"remaining":998,"reset_after":3600}}"#,
        )
        .unwrap();
        assert_eq!(bot.shards, 2);
        let limit = bot.session_start_limit.unwrap();
        assert_eq!(limit.remaining, 998);
        assert_eq!(limit.max_concurrency, 1);
    }
}
