pub mod crypto;

pub mod audio {
    pub mod opus;
}

pub use audio::opus::{OpusDecoder, OpusEncoder, OpusError};
pub use crypto::{CryptoError, EncryptionMode, PacketSealer};
