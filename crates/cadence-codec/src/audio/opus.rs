// Opus encode/decode wrapper for 48 kHz interleaved stereo.

use audiopus::{
    coder::{Decoder as OpusDecoderInner, Encoder as OpusEncoderInner},
    packet::Packet,
    Application, Bitrate, Channels, MutSignals, SampleRate,
};
use thiserror::Error;

/// 48 kHz sample rate (native for Opus).
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: usize = 2;
/// 20 ms frame at 48 kHz = 960 samples per channel.
pub const FRAME_SIZE: usize = 960;
/// Interleaved samples in one 20 ms stereo frame.
pub const FRAME_SAMPLES: usize = FRAME_SIZE * CHANNELS;
/// Bytes of s16le PCM in one 20 ms stereo frame.
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;
/// Maximum Opus packet size (recommended by RFC 6716).
const MAX_PACKET_SIZE: usize = 4000;
/// Longest frame Opus can produce (120 ms).
const MAX_DECODED_FRAME: usize = 5760;

/// Three-byte Opus frame that decodes to silence.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

#[derive(Debug, Error)]
pub enum OpusError {
    #[error("opus error: {0}")]
    Encoder(#[from] audiopus::Error),
    #[error("frame size mismatch: expected {expected}, got {actual}")]
    FrameSizeMismatch { expected: usize, actual: usize },
}

/// Opus encoder for 48 kHz stereo music and voice.
pub struct OpusEncoder {
    inner: OpusEncoderInner,
    encode_buf: Vec<u8>,
}

impl OpusEncoder {
    /// 48 kHz stereo, Audio application, 128 kbps, in-band FEC on.
    pub fn new() -> Result<Self, OpusError> {
        let mut encoder =
            OpusEncoderInner::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)?;
        encoder.set_bitrate(Bitrate::BitsPerSecond(128_000))?;
        encoder.set_inband_fec(true)?;
        encoder.set_packet_loss_perc(15u8)?;

        Ok(Self {
            inner: encoder,
            encode_buf: vec![0u8; MAX_PACKET_SIZE],
        })
    }

    /// Encode one 20 ms frame of interleaved stereo `i16` (1920 samples).
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, OpusError> {
        if pcm.len() != FRAME_SAMPLES {
            return Err(OpusError::FrameSizeMismatch {
                expected: FRAME_SAMPLES,
                actual: pcm.len(),
            });
        }

        let len = self.inner.encode(pcm, &mut self.encode_buf)?;
        Ok(self.encode_buf[..len].to_vec())
    }
}

/// Opus decoder for a single remote SSRC.
pub struct OpusDecoder {
    inner: OpusDecoderInner,
    decode_buf: Vec<i16>,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, OpusError> {
        let decoder = OpusDecoderInner::new(SampleRate::Hz48000, Channels::Stereo)?;
        Ok(Self {
            inner: decoder,
            decode_buf: vec![0i16; MAX_DECODED_FRAME * CHANNELS],
        })
    }

    /// Decode a packet into interleaved stereo samples.
    pub fn decode(&mut self, packet_data: &[u8]) -> Result<Vec<i16>, OpusError> {
        let pkt: Packet<'_> = packet_data.try_into()?;
        let output: MutSignals<'_, i16> = (&mut self.decode_buf[..]).try_into()?;
        let per_channel = self.inner.decode(Some(pkt), output, false)?;
        Ok(self.decode_buf[..per_channel * CHANNELS].to_vec())
    }
}
