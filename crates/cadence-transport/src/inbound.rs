use bytes::Buf;
use cadence_codec::PacketSealer;

use crate::rtp::{RtpHeader, HEADER_SIZE, RTP_VERSION};
use crate::TransportError;

/// RTCP payload types as seen through the 7-bit RTP payload-type field.
const RTCP_PAYLOAD_TYPES: std::ops::RangeInclusive<u8> = 72..=76;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub ssrc: u32,
    pub sequence: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub opus: Vec<u8>,
}

/// Parse and open one received voice datagram.
///
/// Returns `Ok(None)` for RTCP traffic, which is not voice.
pub fn open_packet(
    sealer: &PacketSealer,
    packet: &[u8],
) -> Result<Option<InboundPacket>, TransportError> {
    let header = RtpHeader::decode(&mut &packet[..])?;
    if header.version != RTP_VERSION {
        return Err(TransportError::UnsupportedVersion(header.version));
    }
    if RTCP_PAYLOAD_TYPES.contains(&header.payload_type) {
        return Ok(None);
    }

    let body_start = HEADER_SIZE + 4 * header.csrc_count as usize;
    if packet.len() < body_start {
        return Err(TransportError::BufferTooShort {
            expected: body_start,
            actual: packet.len(),
        });
    }

    let mut opus = sealer.open(&packet[..HEADER_SIZE], &packet[body_start..])?;

    // The header extension travels inside the sealed body.
    if header.extension {
        if opus.len() < 4 {
            return Err(TransportError::BufferTooShort {
                expected: 4,
                actual: opus.len(),
            });
        }
        let words = (&opus[2..4]).get_u16() as usize;
        let skip = 4 + words * 4;
        if opus.len() < skip {
            return Err(TransportError::BufferTooShort {
                expected: skip,
                actual: opus.len(),
            });
        }
        opus.drain(..skip);
    }

    Ok(Some(InboundPacket {
        ssrc: header.ssrc,
        sequence: header.sequence,
        timestamp: header.timestamp,
        payload_type: header.payload_type,
        opus,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_codec::EncryptionMode;

    const KEY: [u8; 32] = [3u8; 32];

    fn build(header: RtpHeader, csrcs: &[u32], sealed_body: &[u8], mode: EncryptionMode) -> Vec<u8> {
        let mut sealer = PacketSealer::new(mode, &KEY).unwrap();
        let head = header.to_array();
        let mut out = head.to_vec();
        for c in csrcs {
            out.extend_from_slice(&c.to_be_bytes());
        }
        sealer.seal(&head, sealed_body, &mut out).unwrap();
        out
    }

    #[test]
    fn opens_plain_voice_packet() {
        let header = RtpHeader::opus(10, 9600, 42);
        let packet = build(header, &[], b"opus-data", EncryptionMode::Suffix);
        let sealer = PacketSealer::new(EncryptionMode::Suffix, &KEY).unwrap();
        let opened = open_packet(&sealer, &packet).unwrap().unwrap();
        assert_eq!(opened.ssrc, 42);
        assert_eq!(opened.sequence, 10);
        assert_eq!(opened.timestamp, 9600);
        assert_eq!(opened.opus, b"opus-data");
    }

    #[test]
    fn skips_csrcs_and_strips_extension() {
        let mut header = RtpHeader::opus(1, 960, 7);
        header.csrc_count = 2;
        header.extension = true;

        // 0xBEDE profile, two 32-bit words of extension data.
        let mut body = vec![0xBE, 0xDE, 0x00, 0x02, 1, 2, 3, 4, 5, 6, 7, 8];
        body.extend_from_slice(b"voice");
        let packet = build(header, &[11, 22], &body, EncryptionMode::Lite);

        let sealer = PacketSealer::new(EncryptionMode::Lite, &KEY).unwrap();
        let opened = open_packet(&sealer, &packet).unwrap().unwrap();
        assert_eq!(opened.opus, b"voice");
    }

    #[test]
    fn ignores_rtcp() {
        let sealer = PacketSealer::new(EncryptionMode::Normal, &KEY).unwrap();
        for pt in 72..=76u8 {
            let mut header = RtpHeader::opus(0, 0, 1);
            header.payload_type = pt;
            let packet = header.to_array();
            assert_eq!(open_packet(&sealer, &packet).unwrap(), None);
        }
    }

    #[test]
    fn rejects_bad_version_and_bad_key() {
        let sealer = PacketSealer::new(EncryptionMode::Normal, &KEY).unwrap();
        let mut header = RtpHeader::opus(0, 0, 1);
        header.version = 1;
        assert!(matches!(
            open_packet(&sealer, &header.to_array()),
            Err(TransportError::UnsupportedVersion(1))
        ));

        let packet = build(RtpHeader::opus(0, 0, 1), &[], b"x", EncryptionMode::Normal);
        let other = PacketSealer::new(EncryptionMode::Normal, &[9u8; 32]).unwrap();
        assert!(matches!(
            open_packet(&other, &packet),
            Err(TransportError::Crypto(_))
        ));
    }
}
