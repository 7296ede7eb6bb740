use cadence_gateway::GatewayError;
use cadence_voice::VoiceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("voice error: {0}")]
    Voice(#[from] VoiceError),
    #[error("background task failed: {0}")]
    Task(String),
}
