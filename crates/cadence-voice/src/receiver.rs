use std::collections::HashMap;
use std::sync::Arc;

use cadence_codec::{OpusDecoder, PacketSealer};
use cadence_models::Snowflake;
use cadence_transport::open_packet;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MAX_DATAGRAM: usize = 2048;

/// One decoded inbound voice frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicePacket {
    pub ssrc: u32,
    pub user_id: Option<Snowflake>,
    pub sequence: u16,
    pub timestamp: u32,
    /// Interleaved stereo s16 at 48 kHz.
    pub pcm: Vec<i16>,
}

/// Read the voice socket until cancelled, decoding each speaker separately.
pub fn spawn_receiver(
    socket: Arc<UdpSocket>,
    opener: PacketSealer,
    speakers: Arc<DashMap<u32, Snowflake>>,
    out: mpsc::Sender<VoicePacket>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut decoders: HashMap<u32, OpusDecoder> = HashMap::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let len = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv(&mut buf) => match received {
                    Ok(len) => len,
                    Err(e) => {
                        tracing::debug!(error = %e, "voice receive failed");
                        continue;
                    }
                },
            };

            let packet = match open_packet(&opener, &buf[..len]) {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(e) => {
                    tracing::trace!(target: "voice_wire", error = %e, len, "dropping inbound datagram");
                    continue;
                }
            };

            let decoder = match decoders.entry(packet.ssrc) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => match OpusDecoder::new() {
                    Ok(decoder) => entry.insert(decoder),
                    Err(e) => {
                        tracing::warn!(error = %e, ssrc = packet.ssrc, "opus decoder unavailable");
                        continue;
                    }
                },
            };
            let pcm = match decoder.decode(&packet.opus) {
                Ok(pcm) => pcm,
                Err(e) => {
                    tracing::debug!(error = %e, ssrc = packet.ssrc, "opus decode failed");
                    continue;
                }
            };

            let voice = VoicePacket {
                ssrc: packet.ssrc,
                user_id: speakers.get(&packet.ssrc).map(|u| *u),
                sequence: packet.sequence,
                timestamp: packet.timestamp,
                pcm,
            };
            if out.try_send(voice).is_err() {
                if out.is_closed() {
                    break;
                }
                tracing::trace!(ssrc = packet.ssrc, "voice packet consumer lagging, dropped");
            }
        }
        tracing::debug!("voice receiver stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_codec::audio::opus::{FRAME_SAMPLES, SILENCE_FRAME};
    use cadence_codec::EncryptionMode;
    use cadence_transport::{RtpContext, VoiceSender};
    use std::time::Duration;

    #[tokio::test]
    async fn decodes_and_attributes_speakers() {
        let key = [1u8; 32];
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        local.connect(remote.local_addr().unwrap()).await.unwrap();
        remote.connect(local.local_addr().unwrap()).await.unwrap();

        let speakers = Arc::new(DashMap::new());
        speakers.insert(4242u32, Snowflake(77));
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = spawn_receiver(
            Arc::new(local),
            PacketSealer::new(EncryptionMode::Suffix, &key).unwrap(),
            speakers,
            tx,
            cancel.clone(),
        );

        let mut sender = VoiceSender::new(
            Arc::new(remote),
            PacketSealer::new(EncryptionMode::Suffix, &key).unwrap(),
            RtpContext::new(4242),
        );
        sender.send_opus(&SILENCE_FRAME, 960).unwrap();

        let packet = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.ssrc, 4242);
        assert_eq!(packet.user_id, Some(Snowflake(77)));
        assert_eq!(packet.pcm.len(), FRAME_SAMPLES);

        cancel.cancel();
        task.await.unwrap();
    }
}
