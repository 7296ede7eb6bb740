use std::time::Duration;

use cadence_codec::CryptoError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },
    #[error("unsupported RTP version: {0}")]
    UnsupportedVersion(u8),
    #[error("ip discovery timed out after {0:?}")]
    DiscoveryTimeout(Duration),
    #[error("malformed ip discovery response: {0}")]
    DiscoveryMalformed(&'static str),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}
