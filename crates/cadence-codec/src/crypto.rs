// Voice packet sealing with XSalsa20-Poly1305 (NaCl secretbox).

use crypto_secretbox::{
    aead::{AeadInPlace, KeyInit},
    Nonce, Tag, XSalsa20Poly1305,
};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Secret key size in bytes.
pub const KEY_SIZE: usize = 32;
/// Poly1305 authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;
/// XSalsa20 nonce size in bytes.
pub const NONCE_SIZE: usize = 24;
/// Fixed RTP header length used as the nonce in normal mode.
pub const RTP_HEADER_SIZE: usize = 12;
/// Counter trailer appended in lite mode.
pub const LITE_NONCE_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("secret key must be {KEY_SIZE} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("unsupported encryption mode: {0}")]
    UnsupportedMode(String),
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed (authentication error)")]
    DecryptionFailed,
    #[error("ciphertext too short")]
    CiphertextTooShort,
}

/// How the per-packet nonce is derived and carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionMode {
    /// RTP header zero-padded to 24 bytes; nothing appended.
    Normal,
    /// 24 random bytes appended to the packet.
    Suffix,
    /// 4-byte big-endian counter appended to the packet.
    Lite,
}

impl EncryptionMode {
    /// Modes we can speak, most preferred first.
    pub const PREFERENCE: [EncryptionMode; 3] =
        [EncryptionMode::Lite, EncryptionMode::Suffix, EncryptionMode::Normal];

    pub fn name(self) -> &'static str {
        match self {
            EncryptionMode::Normal => "xsalsa20_poly1305",
            EncryptionMode::Suffix => "xsalsa20_poly1305_suffix",
            EncryptionMode::Lite => "xsalsa20_poly1305_lite",
        }
    }

    /// First mode in preference order that the server offers.
    pub fn negotiate<S: AsRef<str>>(offered: &[S]) -> Option<Self> {
        Self::PREFERENCE
            .into_iter()
            .find(|mode| offered.iter().any(|o| o.as_ref() == mode.name()))
    }

    /// Bytes appended after the ciphertext.
    pub fn trailer_len(self) -> usize {
        match self {
            EncryptionMode::Normal => 0,
            EncryptionMode::Suffix => NONCE_SIZE,
            EncryptionMode::Lite => LITE_NONCE_SIZE,
        }
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EncryptionMode {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::PREFERENCE
            .into_iter()
            .find(|mode| mode.name() == s)
            .ok_or_else(|| CryptoError::UnsupportedMode(s.to_string()))
    }
}

/// Seals and opens RTP payloads under the session key.
///
/// Sealed layout is `tag(16) || ciphertext || trailer`, where the trailer
/// depends on the [`EncryptionMode`].
pub struct PacketSealer {
    cipher: XSalsa20Poly1305,
    mode: EncryptionMode,
    lite_counter: u32,
}

impl PacketSealer {
    pub fn new(mode: EncryptionMode, key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        let cipher = XSalsa20Poly1305::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
        Ok(Self {
            cipher,
            mode,
            lite_counter: 0,
        })
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    /// Append the sealed form of `payload` to `out`. On error `out` is left
    /// as it was and no nonce state is consumed.
    pub fn seal(
        &mut self,
        header: &[u8; RTP_HEADER_SIZE],
        payload: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        match self.mode {
            EncryptionMode::Normal => nonce[..RTP_HEADER_SIZE].copy_from_slice(header),
            EncryptionMode::Suffix => nonce = rand::random(),
            EncryptionMode::Lite => {
                nonce[..LITE_NONCE_SIZE].copy_from_slice(&self.lite_counter.to_be_bytes())
            }
        }

        let start = out.len();
        out.resize(start + TAG_SIZE, 0);
        out.extend_from_slice(payload);
        let tag = match self.cipher.encrypt_in_place_detached(
            Nonce::from_slice(&nonce),
            b"",
            &mut out[start + TAG_SIZE..],
        ) {
            Ok(tag) => tag,
            Err(_) => {
                out.truncate(start);
                return Err(CryptoError::EncryptionFailed);
            }
        };
        out[start..start + TAG_SIZE].copy_from_slice(&tag);

        match self.mode {
            EncryptionMode::Normal => {}
            EncryptionMode::Suffix => out.extend_from_slice(&nonce),
            EncryptionMode::Lite => {
                out.extend_from_slice(&nonce[..LITE_NONCE_SIZE]);
                self.lite_counter = self.lite_counter.wrapping_add(1);
            }
        }
        Ok(())
    }

    /// Open `body` (everything after the fixed RTP header) of a received packet.
    pub fn open(&self, header: &[u8], body: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let trailer = self.mode.trailer_len();
        if body.len() < TAG_SIZE + trailer {
            return Err(CryptoError::CiphertextTooShort);
        }
        let (sealed, carried) = body.split_at(body.len() - trailer);

        let mut nonce = [0u8; NONCE_SIZE];
        match self.mode {
            EncryptionMode::Normal => {
                if header.len() < RTP_HEADER_SIZE {
                    return Err(CryptoError::CiphertextTooShort);
                }
                nonce[..RTP_HEADER_SIZE].copy_from_slice(&header[..RTP_HEADER_SIZE]);
            }
            EncryptionMode::Suffix | EncryptionMode::Lite => {
                nonce[..carried.len()].copy_from_slice(carried)
            }
        }

        let (tag, ciphertext) = sealed.split_at(TAG_SIZE);
        let mut plaintext = ciphertext.to_vec();
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                b"",
                &mut plaintext,
                Tag::from_slice(tag),
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: [u8; RTP_HEADER_SIZE] = [
        0x80, 0x78, 0x00, 0x01, // version, payload type, sequence=1
        0x00, 0x00, 0x03, 0xC0, // timestamp=960
        0xDE, 0xAD, 0xBE, 0xEF, // ssrc
    ];

    fn key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        key
    }

    #[test]
    fn seal_open_round_trip_all_modes() {
        let payload = [0xFCu8, 0x01, 0x02, 0x03, 0x04];
        for mode in EncryptionMode::PREFERENCE {
            let mut sealer = PacketSealer::new(mode, &key()).unwrap();
            let mut out = Vec::new();
            sealer.seal(&HEADER, &payload, &mut out).unwrap();
            assert_eq!(out.len(), TAG_SIZE + payload.len() + mode.trailer_len(), "{mode}");

            let opened = sealer.open(&HEADER, &out).unwrap();
            assert_eq!(opened, payload, "{mode}");
        }
    }

    #[test]
    fn normal_mode_binds_the_header() {
        let mut sealer = PacketSealer::new(EncryptionMode::Normal, &key()).unwrap();
        let mut out = Vec::new();
        sealer.seal(&HEADER, b"opus", &mut out).unwrap();

        let mut other = HEADER;
        other[3] = 0x02;
        assert!(matches!(
            sealer.open(&other, &out),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn lite_counter_increments_per_packet() {
        let mut sealer = PacketSealer::new(EncryptionMode::Lite, &key()).unwrap();
        let mut first = Vec::new();
        let mut second = Vec::new();
        sealer.seal(&HEADER, b"a", &mut first).unwrap();
        sealer.seal(&HEADER, b"a", &mut second).unwrap();
        assert_eq!(&first[first.len() - 4..], &[0, 0, 0, 0]);
        assert_eq!(&second[second.len() - 4..], &[0, 0, 0, 1]);
        assert_ne!(first[..TAG_SIZE], second[..TAG_SIZE]);
    }

    #[test]
    fn seal_appends_after_existing_bytes() {
        let mut sealer = PacketSealer::new(EncryptionMode::Suffix, &key()).unwrap();
        let mut out = HEADER.to_vec();
        sealer.seal(&HEADER, b"payload", &mut out).unwrap();
        assert_eq!(&out[..RTP_HEADER_SIZE], &HEADER);
        let opened = sealer.open(&out[..RTP_HEADER_SIZE], &out[RTP_HEADER_SIZE..]).unwrap();
        assert_eq!(opened, b"payload");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let mut sealer = PacketSealer::new(EncryptionMode::Normal, &key()).unwrap();
        let mut out = Vec::new();
        sealer.seal(&HEADER, b"protected", &mut out).unwrap();
        let last = out.len() - 1;
        out[last] ^= 0x01;
        assert!(sealer.open(&HEADER, &out).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let mut sealer = PacketSealer::new(EncryptionMode::Lite, &key()).unwrap();
        let other = PacketSealer::new(EncryptionMode::Lite, &[0xFF; KEY_SIZE]).unwrap();
        let mut out = Vec::new();
        sealer.seal(&HEADER, b"secret", &mut out).unwrap();
        assert!(other.open(&HEADER, &out).is_err());
    }

    #[test]
    fn short_inputs_rejected() {
        assert!(matches!(
            PacketSealer::new(EncryptionMode::Normal, &[0u8; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        ));
        let sealer = PacketSealer::new(EncryptionMode::Suffix, &key()).unwrap();
        assert!(matches!(
            sealer.open(&HEADER, &[0u8; 20]),
            Err(CryptoError::CiphertextTooShort)
        ));
    }

    #[test]
    fn negotiation_prefers_lite() {
        let offered = ["xsalsa20_poly1305", "xsalsa20_poly1305_lite", "aead_aes256_gcm"];
        assert_eq!(EncryptionMode::negotiate(&offered), Some(EncryptionMode::Lite));
        assert_eq!(
            EncryptionMode::negotiate(&["xsalsa20_poly1305"]),
            Some(EncryptionMode::Normal)
        );
        assert_eq!(EncryptionMode::negotiate(&["aead_aes256_gcm_rtpsize"]), None);
        assert_eq!(
            "xsalsa20_poly1305_suffix".parse::<EncryptionMode>().unwrap(),
            EncryptionMode::Suffix
        );
    }
}
