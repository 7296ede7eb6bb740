use std::io::ErrorKind;
use std::sync::Arc;

use cadence_codec::audio::opus::{FRAME_SIZE, SILENCE_FRAME};
use cadence_codec::PacketSealer;
use tokio::net::UdpSocket;

use crate::rtp::{RtpContext, HEADER_SIZE};
use crate::TransportError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendStats {
    pub packets: u64,
    pub bytes: u64,
    /// Datagrams the kernel refused because the send buffer was full.
    pub dropped: u64,
}

/// Seals Opus frames into RTP packets and writes them to the connected voice
/// socket. One sender per voice session; the pacing loop owns it.
pub struct VoiceSender {
    socket: Arc<UdpSocket>,
    sealer: PacketSealer,
    rtp: RtpContext,
    buf: Vec<u8>,
    stats: SendStats,
}

impl VoiceSender {
    pub fn new(socket: Arc<UdpSocket>, sealer: PacketSealer, rtp: RtpContext) -> Self {
        Self {
            socket,
            sealer,
            rtp,
            buf: Vec::with_capacity(1500),
            stats: SendStats::default(),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.rtp.ssrc()
    }

    pub fn rtp(&self) -> &RtpContext {
        &self.rtp
    }

    pub fn stats(&self) -> SendStats {
        self.stats
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    /// Seal and send one Opus frame covering `samples` per-channel samples.
    ///
    /// RTP counters advance once the packet is sealed, whether or not the
    /// datagram makes it out. A seal failure leaves them untouched.
    pub fn send_opus(&mut self, opus: &[u8], samples: u32) -> Result<(), TransportError> {
        let header = self.rtp.header();
        let header_bytes: [u8; HEADER_SIZE] = header.to_array();
        self.buf.clear();
        self.buf.extend_from_slice(&header_bytes);
        self.sealer.seal(&header_bytes, opus, &mut self.buf)?;
        self.rtp.advance(samples);

        match self.socket.try_send(&self.buf) {
            Ok(n) => {
                self.stats.packets += 1;
                self.stats.bytes += n as u64;
                tracing::trace!(
                    target: "voice_wire",
                    seq = header.sequence,
                    ts = header.timestamp,
                    len = n,
                    "rtp out"
                );
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.stats.dropped += 1;
                tracing::debug!(target: "voice_wire", seq = header.sequence, "udp send buffer full, frame dropped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send `frames` Opus silence frames.
    pub fn send_silence(&mut self, frames: usize) -> Result<(), TransportError> {
        for _ in 0..frames {
            self.send_opus(&SILENCE_FRAME, FRAME_SIZE as u32)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::open_packet;
    use cadence_codec::EncryptionMode;

    const KEY: [u8; 32] = [7u8; 32];

    async fn pair(mode: EncryptionMode, rtp: RtpContext) -> (VoiceSender, UdpSocket) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(server.local_addr().unwrap()).await.unwrap();
        let sealer = PacketSealer::new(mode, &KEY).unwrap();
        (VoiceSender::new(Arc::new(socket), sealer, rtp), server)
    }

    #[tokio::test]
    async fn consecutive_frames_have_contiguous_rtp() {
        let (mut sender, server) =
            pair(EncryptionMode::Lite, RtpContext::starting_at(0xABCD, 40_000, 123)).await;
        let opener = PacketSealer::new(EncryptionMode::Lite, &KEY).unwrap();

        for i in 0..8u8 {
            sender.send_opus(&[0xFC, i], 960).unwrap();
        }

        let mut buf = [0u8; 1500];
        for i in 0..8u16 {
            let n = server.recv(&mut buf).await.unwrap();
            let packet = open_packet(&opener, &buf[..n]).unwrap().unwrap();
            assert_eq!(packet.ssrc, 0xABCD);
            assert_eq!(packet.sequence, 40_000 + i);
            assert_eq!(packet.timestamp, 123 + 960 * i as u32);
            assert_eq!(packet.opus, vec![0xFC, i as u8]);
        }
        assert_eq!(sender.stats().packets, 8);
    }

    #[tokio::test]
    async fn silence_uses_silence_frame() {
        let (mut sender, server) = pair(EncryptionMode::Normal, RtpContext::new(9)).await;
        let opener = PacketSealer::new(EncryptionMode::Normal, &KEY).unwrap();
        sender.send_silence(5).unwrap();
        assert_eq!(sender.rtp().sequence(), 5);
        assert_eq!(sender.rtp().timestamp(), 5 * 960);

        let mut buf = [0u8; 256];
        let n = server.recv(&mut buf).await.unwrap();
        let packet = open_packet(&opener, &buf[..n]).unwrap().unwrap();
        assert_eq!(packet.opus, SILENCE_FRAME);
        assert_eq!(&buf[..2], &[0x80, 0x78]);
    }
}
