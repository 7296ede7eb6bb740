use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

use crate::TransportError;

/// Fixed RTP header.
///
/// ```text
/// Byte 0:     [V:2][P:1][X:1][CC:4]     0x80 for outbound voice
/// Byte 1:     [M:1][PT:7]               0x78 (payload type 120)
/// Bytes 2-3:  Sequence number (u16)
/// Bytes 4-7:  Timestamp (u32, 48 kHz clock)
/// Bytes 8-11: SSRC (u32)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

pub const HEADER_SIZE: usize = 12;
pub const RTP_VERSION: u8 = 2;
pub const PAYLOAD_TYPE_OPUS: u8 = 0x78;

impl RtpHeader {
    pub fn opus(sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: PAYLOAD_TYPE_OPUS,
            sequence,
            timestamp,
            ssrc,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        let byte0 = ((self.version & 0x03) << 6)
            | ((self.padding as u8) << 5)
            | ((self.extension as u8) << 4)
            | (self.csrc_count & 0x0F);
        buf.put_u8(byte0);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, TransportError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(TransportError::BufferTooShort {
                expected: HEADER_SIZE,
                actual: buf.remaining(),
            });
        }

        let byte0 = buf.get_u8();
        let byte1 = buf.get_u8();
        Ok(Self {
            version: byte0 >> 6,
            padding: byte0 & 0x20 != 0,
            extension: byte0 & 0x10 != 0,
            csrc_count: byte0 & 0x0F,
            marker: byte1 & 0x80 != 0,
            payload_type: byte1 & 0x7F,
            sequence: buf.get_u16(),
            timestamp: buf.get_u32(),
            ssrc: buf.get_u32(),
        })
    }

    pub fn to_array(&self) -> [u8; HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        self.encode(&mut buf);
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }
}

impl fmt::Display for RtpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RtpHeader(pt={}, seq={}, ts={}, ssrc={:#x})",
            self.payload_type, self.sequence, self.timestamp, self.ssrc
        )
    }
}

/// Outbound sequence/timestamp state for one SSRC. Owned by the pacing loop.
#[derive(Debug, Clone)]
pub struct RtpContext {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpContext {
    pub fn new(ssrc: u32) -> Self {
        Self::starting_at(ssrc, 0, 0)
    }

    pub fn starting_at(ssrc: u32, sequence: u16, timestamp: u32) -> Self {
        Self {
            ssrc,
            sequence,
            timestamp,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Header for the next packet.
    pub fn header(&self) -> RtpHeader {
        RtpHeader::opus(self.sequence, self.timestamp, self.ssrc)
    }

    /// Move past one sent packet carrying `samples` per-channel samples.
    pub fn advance(&mut self, samples: u32) {
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_header_layout() {
        let bytes = RtpHeader::opus(0x0102, 0x0304_0506, 0xDEAD_BEEF).to_array();
        assert_eq!(
            bytes,
            [0x80, 0x78, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn header_round_trip_with_flags() {
        let header = RtpHeader {
            version: 2,
            padding: false,
            extension: true,
            csrc_count: 2,
            marker: true,
            payload_type: 0x78,
            sequence: 65_535,
            timestamp: 7,
            ssrc: 99,
        };
        let bytes = header.to_array();
        let decoded = RtpHeader::decode(&mut &bytes[..]).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn buffer_too_short() {
        let buf = [0u8; 8];
        let result = RtpHeader::decode(&mut &buf[..]);
        assert!(matches!(
            result,
            Err(TransportError::BufferTooShort { expected: 12, actual: 8 })
        ));
    }

    #[test]
    fn context_counters_wrap() {
        let mut ctx = RtpContext::starting_at(1, u16::MAX, u32::MAX - 100);
        ctx.advance(960);
        assert_eq!(ctx.sequence(), 0);
        assert_eq!(ctx.timestamp(), 859);
    }

    #[test]
    fn consecutive_frames_are_contiguous() {
        let mut ctx = RtpContext::starting_at(5, 100, 1_000);
        let mut seen = Vec::new();
        for _ in 0..10 {
            let h = ctx.header();
            seen.push((h.sequence, h.timestamp));
            ctx.advance(960);
        }
        for (i, (seq, ts)) in seen.into_iter().enumerate() {
            assert_eq!(seq, 100 + i as u16);
            assert_eq!(ts, 1_000 + 960 * i as u32);
        }
    }
}
