use std::time::Duration;

use cadence_codec::{CryptoError, OpusError};
use cadence_gateway::GatewayError;
use cadence_transport::TransportError;
use cadence_ws::ConnectError;

#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("gateway session is not ready yet")]
    NotReady,
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("voice server assignment did not arrive within {0:?}")]
    RendezvousTimeout(Duration),
    #[error("join superseded by a newer request")]
    Superseded,
    #[error("timed out after {after:?} waiting for {step}")]
    Timeout { step: &'static str, after: Duration },
    #[error("voice socket connect failed: {0}")]
    Connect(#[from] ConnectError),
    #[error("voice socket closed (code {code:?})")]
    Closed { code: Option<u16> },
    #[error("no supported encryption mode in {0:?}")]
    UnsupportedModes(Vec<String>),
    #[error("invalid voice server address: {0}")]
    InvalidAddress(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("opus error: {0}")]
    Opus(#[from] OpusError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("gave up after {attempts} voice reconnect attempts")]
    ReconnectsExhausted { attempts: u32 },
}
