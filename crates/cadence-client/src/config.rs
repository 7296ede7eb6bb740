use anyhow::Result;
use cadence_core::{ClientSettings, CorrelatorSettings};
use cadence_gateway::bootstrap::DEFAULT_API_BASE;
use cadence_gateway::{GatewaySettings, ReconnectPolicy};
use cadence_models::GatewayIntents;
use cadence_voice::{PipelineSettings, VoiceSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub correlator: CorrelatorConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub token: String,
    /// Explicit gateway URL. When unset the URL is looked up over HTTP.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_intents")]
    pub intents: u64,
    #[serde(default = "default_hello_timeout_ms")]
    pub hello_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            url: None,
            api_base: default_api_base(),
            intents: default_intents(),
            hello_timeout_ms: default_hello_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Backoff bounds shared by the gateway and voice connections.
#[derive(Debug, Deserialize, Serialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_invalid_session_min_ms")]
    pub invalid_session_min_ms: u64,
    #[serde(default = "default_invalid_session_max_ms")]
    pub invalid_session_max_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            invalid_session_min_ms: default_invalid_session_min_ms(),
            invalid_session_max_ms: default_invalid_session_max_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct VoiceConfig {
    #[serde(default = "default_rendezvous_timeout_ms")]
    pub rendezvous_timeout_ms: u64,
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    #[serde(default = "default_false")]
    pub self_mute: bool,
    #[serde(default = "default_false")]
    pub self_deaf: bool,
    #[serde(default = "default_false")]
    pub receive: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            rendezvous_timeout_ms: default_rendezvous_timeout_ms(),
            step_timeout_ms: default_step_timeout_ms(),
            self_mute: false,
            self_deaf: false,
            receive: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_idle_ticks")]
    pub idle_ticks: u32,
    /// Busy-wait window before each send, in microseconds.
    #[serde(default = "default_spin_window_us")]
    pub spin_window_us: u64,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            idle_ticks: default_idle_ticks(),
            spin_window_us: default_spin_window_us(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CorrelatorConfig {
    #[serde(default = "default_wait_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_not_authorized_message")]
    pub not_authorized_message: String,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_wait_timeout_ms(),
            not_authorized_message: default_not_authorized_message(),
        }
    }
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}
fn default_intents() -> u64 {
    GatewayIntents::default().bits()
}
fn default_hello_timeout_ms() -> u64 {
    20_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_event_capacity() -> usize {
    4096
}
fn default_max_attempts() -> u32 {
    10
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_invalid_session_min_ms() -> u64 {
    1_000
}
fn default_invalid_session_max_ms() -> u64 {
    5_000
}
fn default_rendezvous_timeout_ms() -> u64 {
    10_000
}
fn default_step_timeout_ms() -> u64 {
    5_000
}
fn default_false() -> bool {
    false
}
fn default_idle_ticks() -> u32 {
    250
}
fn default_spin_window_us() -> u64 {
    1_000
}
fn default_keepalive_interval_ms() -> u64 {
    5_000
}
fn default_queue_capacity() -> usize {
    250
}
fn default_wait_timeout_ms() -> u64 {
    120_000
}
fn default_not_authorized_message() -> String {
    CorrelatorSettings::default().not_authorized_message
}

// ── Config Loading ───────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!("Config file not found at '{}', using defaults", path);
            Config::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Environment overrides. Unparseable values are ignored with a warning.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(value) = var("CADENCE_TOKEN") {
            self.gateway.token = value;
        }
        if let Some(value) = var("CADENCE_GATEWAY_URL") {
            self.gateway.url = Some(value).filter(|v| !v.trim().is_empty());
        }
        if let Some(value) = var("CADENCE_API_BASE") {
            self.gateway.api_base = value;
        }
        override_parsed(&var, "CADENCE_INTENTS", &mut self.gateway.intents);
        override_parsed(
            &var,
            "CADENCE_RECONNECT_MAX_ATTEMPTS",
            &mut self.reconnect.max_attempts,
        );
        override_parsed(
            &var,
            "CADENCE_VOICE_RENDEZVOUS_TIMEOUT_MS",
            &mut self.voice.rendezvous_timeout_ms,
        );
        override_parsed(&var, "CADENCE_PIPELINE_IDLE_TICKS", &mut self.pipeline.idle_ticks);
        override_parsed(
            &var,
            "CADENCE_PIPELINE_SPIN_WINDOW_US",
            &mut self.pipeline.spin_window_us,
        );
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let r = &self.reconnect;
        ReconnectPolicy {
            max_attempts: r.max_attempts,
            base_delay: Duration::from_millis(r.base_delay_ms),
            max_delay: Duration::from_millis(r.max_delay_ms.max(r.base_delay_ms)),
            invalid_session_min: Duration::from_millis(r.invalid_session_min_ms),
            invalid_session_max: Duration::from_millis(
                r.invalid_session_max_ms.max(r.invalid_session_min_ms),
            ),
        }
    }

    /// Build library settings. `gateway_url` is the resolved socket URL.
    pub fn client_settings(&self, gateway_url: &str) -> ClientSettings {
        let mut gateway = GatewaySettings::new(self.gateway.token.clone()).with_url(gateway_url);
        gateway.intents = GatewayIntents::from_bits_truncate(self.gateway.intents);
        gateway.policy = self.reconnect_policy();
        gateway.hello_timeout = Duration::from_millis(self.gateway.hello_timeout_ms);
        gateway.connect.timeout = Duration::from_millis(self.gateway.connect_timeout_ms);

        let pipeline = PipelineSettings {
            spin_window: Duration::from_micros(self.pipeline.spin_window_us),
            idle_ticks: self.pipeline.idle_ticks.max(1),
            keepalive_interval: Duration::from_millis(self.pipeline.keepalive_interval_ms),
            queue_capacity: self.pipeline.queue_capacity.max(1),
            ..PipelineSettings::default()
        };
        let voice = VoiceSettings {
            rendezvous_timeout: Duration::from_millis(self.voice.rendezvous_timeout_ms),
            step_timeout: Duration::from_millis(self.voice.step_timeout_ms),
            policy: self.reconnect_policy(),
            connect: gateway.connect,
            self_mute: self.voice.self_mute,
            self_deaf: self.voice.self_deaf,
            receive: self.voice.receive,
            pipeline,
        };
        let correlator = CorrelatorSettings {
            default_timeout: Duration::from_millis(self.correlator.default_timeout_ms),
            not_authorized_message: self.correlator.not_authorized_message.clone(),
        };

        ClientSettings {
            gateway,
            voice,
            correlator,
            event_capacity: self.gateway.event_capacity,
        }
    }
}

fn override_parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(value) = var(key) else {
        return;
    };
    match value.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!("Ignoring invalid {} value '{}'", key, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_file_uses_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("absent.toml");
        let config = Config::load(path.to_str().expect("utf8")).expect("load");
        assert_eq!(config.pipeline.idle_ticks, 250);
        assert_eq!(config.reconnect.max_attempts, 10);
        assert!(!path.exists());
    }

    #[test]
    fn partial_file_keeps_field_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("cadence.toml");
        fs::write(
            &path,
            r#"
[gateway]
token = "abc"
url = "wss://gw.example.com/?v=10&encoding=json"

[pipeline]
idle_ticks = 50

[correlator]
default_timeout_ms = 3000
"#,
        )
        .expect("write");
        let config = Config::load(path.to_str().expect("utf8")).expect("load");
        assert_eq!(config.gateway.token, "abc");
        assert_eq!(config.gateway.api_base, DEFAULT_API_BASE);
        assert_eq!(config.pipeline.idle_ticks, 50);
        assert_eq!(config.pipeline.spin_window_us, 1_000);

        let settings = config.client_settings("wss://gw.example.com/?v=10&encoding=json");
        assert_eq!(settings.voice.pipeline.idle_ticks, 50);
        assert_eq!(settings.correlator.default_timeout, Duration::from_secs(3));
        assert_eq!(settings.gateway.url, "wss://gw.example.com/?v=10&encoding=json");
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        config.apply_overrides(vars(&[
            ("CADENCE_TOKEN", "from-env"),
            ("CADENCE_INTENTS", "641"),
            ("CADENCE_RECONNECT_MAX_ATTEMPTS", "3"),
            ("CADENCE_VOICE_RENDEZVOUS_TIMEOUT_MS", "2500"),
            ("CADENCE_PIPELINE_IDLE_TICKS", "100"),
            ("CADENCE_PIPELINE_SPIN_WINDOW_US", "0"),
        ]));
        assert_eq!(config.gateway.token, "from-env");
        assert_eq!(config.gateway.intents, 641);
        assert_eq!(config.reconnect.max_attempts, 3);

        let settings = config.client_settings("ws://127.0.0.1:1/");
        assert_eq!(settings.gateway.policy.max_attempts, 3);
        assert_eq!(settings.voice.policy.max_attempts, 3);
        assert_eq!(settings.voice.rendezvous_timeout, Duration::from_millis(2500));
        assert_eq!(settings.voice.pipeline.idle_ticks, 100);
        assert_eq!(settings.voice.pipeline.spin_window, Duration::ZERO);
        assert!(settings
            .gateway
            .intents
            .contains(GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES));
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut config = Config::default();
        config.apply_overrides(vars(&[
            ("CADENCE_PIPELINE_IDLE_TICKS", "lots"),
            ("CADENCE_RECONNECT_MAX_ATTEMPTS", "-1"),
            ("CADENCE_GATEWAY_URL", "  "),
        ]));
        assert_eq!(config.pipeline.idle_ticks, 250);
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.gateway.url, None);
    }
}
