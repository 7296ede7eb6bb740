use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cadence_codec::{EncryptionMode, PacketSealer};
use cadence_gateway::{GatewayConnection, GatewayHandle, GatewaySettings, ReconnectPolicy};
use cadence_models::Snowflake;
use cadence_transport::{open_packet, InboundPacket};
use cadence_voice::{
    spawn_pcm_reader, ItemOutcome, JoinRequest, PipelineSettings, VoiceConnection, VoiceError,
    VoiceHandle, VoiceRendezvous, VoiceSettings, VoiceStatus,
};
use cadence_ws::testing::FakePeer;
use cadence_ws::OpCode;
use serde_json::{json, Value};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

const GUILD: Snowflake = Snowflake(500);
const CHANNEL: Snowflake = Snowflake(600);
const KEY: [u8; 32] = [9u8; 32];

/// Fake gateway that answers voice state updates with both voice dispatches.
struct Gateway {
    handle: GatewayHandle,
    rendezvous: Arc<VoiceRendezvous>,
    /// Every op 4 the client sent, in order.
    updates: mpsc::UnboundedReceiver<Value>,
}

async fn start_gateway(voice_endpoint: String) -> Gateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/?v=10&encoding=json", listener.local_addr().unwrap());
    let rendezvous = VoiceRendezvous::new();
    let (connection, handle) = GatewayConnection::new(
        GatewaySettings::new("token").with_url(url),
        rendezvous.clone(),
    );
    tokio::spawn(connection.run());

    let (updates_tx, updates) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut peer = FakePeer::accept(&listener).await.unwrap();
        peer.send_json(json!({ "op": 10, "d": { "heartbeat_interval": 45_000 } })).await;
        peer.recv_op(2).await.unwrap();
        peer.send_json(json!({
            "op": 0, "s": 1, "t": "READY",
            "d": { "session_id": "gw-session", "user": { "id": "1" } }
        }))
        .await;

        let mut seq = 1;
        let mut sessions = 0;
        while let Some(update) = peer.recv_op(4).await {
            let joining = !update["d"]["channel_id"].is_null();
            let _ = updates_tx.send(update);
            if !joining {
                continue;
            }
            sessions += 1;
            seq += 1;
            peer.send_json(json!({
                "op": 0, "s": seq, "t": "VOICE_SERVER_UPDATE",
                "d": { "guild_id": GUILD.to_string(), "token": "voice-token", "endpoint": voice_endpoint }
            }))
            .await;
            seq += 1;
            peer.send_json(json!({
                "op": 0, "s": seq, "t": "VOICE_STATE_UPDATE",
                "d": {
                    "guild_id": GUILD.to_string(),
                    "channel_id": CHANNEL.to_string(),
                    "user_id": "1",
                    "session_id": format!("voice-session-{sessions}")
                }
            }))
            .await;
        }
    });

    handle.wait_ready().await.unwrap();
    Gateway {
        handle,
        rendezvous,
        updates,
    }
}

/// Fake voice server: websocket signaling plus a UDP endpoint.
struct VoiceServer {
    listener: TcpListener,
    udp: UdpSocket,
}

impl VoiceServer {
    async fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            udp: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    fn endpoint(&self) -> String {
        format!("ws://{}/?v=4", self.listener.local_addr().unwrap())
    }

    /// Run one signaling exchange and return the socket plus the client's
    /// UDP address.
    async fn accept_session(&self, ssrc: u32) -> (FakePeer, SocketAddr) {
        let mut peer = FakePeer::accept(&self.listener).await.unwrap();
        peer.send_json(json!({ "op": 8, "d": { "heartbeat_interval": 41_250.0 } })).await;

        let identify = peer.recv_op(0).await.unwrap();
        assert_eq!(identify["d"]["server_id"], GUILD.to_string());
        assert_eq!(identify["d"]["user_id"], "1");
        assert_eq!(identify["d"]["token"], "voice-token");
        assert!(identify["d"]["session_id"]
            .as_str()
            .unwrap()
            .starts_with("voice-session-"));

        let port = self.udp.local_addr().unwrap().port();
        peer.send_json(json!({
            "op": 2,
            "d": {
                "ssrc": ssrc, "ip": "127.0.0.1", "port": port,
                "modes": ["xsalsa20_poly1305", "xsalsa20_poly1305_lite", "aead_aes256_gcm"]
            }
        }))
        .await;

        let mut buf = [0u8; 128];
        let (len, client) = self.udp.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 74);
        assert_eq!(&buf[..2], &[0x00, 0x01]);
        assert_eq!(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]), ssrc);
        let mut reply = [0u8; 74];
        reply[..2].copy_from_slice(&[0x00, 0x02]);
        reply[2..4].copy_from_slice(&70u16.to_be_bytes());
        reply[4..8].copy_from_slice(&ssrc.to_be_bytes());
        let ip = client.ip().to_string();
        reply[8..8 + ip.len()].copy_from_slice(ip.as_bytes());
        reply[72..].copy_from_slice(&client.port().to_be_bytes());
        self.udp.send_to(&reply, client).await.unwrap();

        let select = peer.recv_op(1).await.unwrap();
        assert_eq!(select["d"]["protocol"], "udp");
        assert_eq!(select["d"]["data"]["mode"], "xsalsa20_poly1305_lite");
        assert_eq!(select["d"]["data"]["address"], "127.0.0.1");
        assert_eq!(select["d"]["data"]["port"], client.port());

        peer.send_json(json!({
            "op": 4,
            "d": { "mode": "xsalsa20_poly1305_lite", "secret_key": KEY.to_vec() }
        }))
        .await;
        (peer, client)
    }

    async fn recv_rtp(&self) -> InboundPacket {
        let opener = PacketSealer::new(EncryptionMode::Lite, &KEY).unwrap();
        let mut buf = [0u8; 1500];
        loop {
            let (len, _) = tokio::time::timeout(Duration::from_secs(5), self.udp.recv_from(&mut buf))
                .await
                .expect("no rtp")
                .unwrap();
            if let Ok(Some(packet)) = open_packet(&opener, &buf[..len]) {
                return packet;
            }
        }
    }
}

fn voice_settings() -> VoiceSettings {
    VoiceSettings {
        policy: ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            ..ReconnectPolicy::default()
        },
        pipeline: PipelineSettings {
            spin_window: Duration::ZERO,
            ..PipelineSettings::default()
        },
        ..VoiceSettings::default()
    }
}

async fn join(gateway: &Gateway) -> Result<VoiceHandle, VoiceError> {
    VoiceConnection::join(
        gateway.handle.clone(),
        gateway.rendezvous.clone(),
        JoinRequest {
            guild_id: GUILD,
            channel_id: CHANNEL,
        },
        voice_settings(),
    )
    .await
}

#[tokio::test]
async fn join_then_stream_pcm() {
    let server = VoiceServer::bind().await;
    let mut gateway = start_gateway(server.endpoint()).await;

    let (joined, session) = tokio::join!(join(&gateway), server.accept_session(4242));
    let handle = joined.unwrap();
    let (mut peer, _) = session;
    assert_eq!(handle.ssrc(), 4242);
    assert_eq!(handle.status(), VoiceStatus::Connected);

    // Leave first, then the real channel.
    let leave = gateway.updates.recv().await.unwrap();
    assert!(leave["d"]["channel_id"].is_null());
    let enter = gateway.updates.recv().await.unwrap();
    assert_eq!(enter["d"]["channel_id"], CHANNEL.to_string());

    let mut completions = handle.pipeline().subscribe();
    let pcm = vec![0u8; 3840 * 3];
    spawn_pcm_reader(std::io::Cursor::new(pcm), handle.pipeline().input(), Some(Snowflake(77)));
    handle.pipeline().play();

    let speaking = peer.recv_op(5).await.unwrap();
    assert_eq!(speaking["d"]["speaking"], 1);
    assert_eq!(speaking["d"]["ssrc"], 4242);

    let first = server.recv_rtp().await;
    assert_eq!(first.ssrc, 4242);
    for i in 1..3u16 {
        let packet = server.recv_rtp().await;
        assert_eq!(packet.sequence, first.sequence.wrapping_add(i));
        assert_eq!(packet.timestamp, first.timestamp.wrapping_add(960 * i as u32));
    }

    let completion = completions.recv().await.unwrap();
    assert_eq!(completion.outcome, ItemOutcome::Finished);
    assert_eq!(completion.user_id, Some(Snowflake(77)));

    handle.disconnect();
    assert_eq!(handle.closed().await, VoiceStatus::Disconnected);
    loop {
        match peer.recv_frame().await {
            Some(frame) if frame.opcode == OpCode::Close => {
                assert_eq!(frame.close_code(), Some(1000));
                break;
            }
            Some(_) => continue,
            None => panic!("socket ended without a close frame"),
        }
    }
    let left = gateway.updates.recv().await.unwrap();
    assert!(left["d"]["channel_id"].is_null());
}

#[tokio::test]
async fn speaking_updates_map_ssrcs() {
    let server = VoiceServer::bind().await;
    let gateway = start_gateway(server.endpoint()).await;
    let (joined, (mut peer, _)) = tokio::join!(join(&gateway), server.accept_session(1));
    let handle = joined.unwrap();

    peer.send_json(json!({ "op": 5, "d": { "user_id": "55", "ssrc": 99, "speaking": 1 } })).await;
    wait_until(|| handle.user_for_ssrc(99) == Some(Snowflake(55))).await;

    peer.send_json(json!({ "op": 13, "d": { "user_id": "55" } })).await;
    wait_until(|| handle.user_for_ssrc(99).is_none()).await;

    handle.disconnect();
    handle.closed().await;
}

#[tokio::test]
async fn server_crash_resignals_and_rebinds() {
    let server = VoiceServer::bind().await;
    let mut gateway = start_gateway(server.endpoint()).await;
    let (joined, (mut peer, _)) = tokio::join!(join(&gateway), server.accept_session(1000));
    let handle = joined.unwrap();
    gateway.updates.recv().await.unwrap();
    gateway.updates.recv().await.unwrap();

    peer.close(4015).await;
    let (_peer2, _) = server.accept_session(2000).await;
    let leave = gateway.updates.recv().await.unwrap();
    assert!(leave["d"]["channel_id"].is_null());
    let enter = gateway.updates.recv().await.unwrap();
    assert_eq!(enter["d"]["channel_id"], CHANNEL.to_string());

    wait_until(|| handle.ssrc() == 2000).await;
    assert_eq!(handle.status(), VoiceStatus::Connected);

    let mut completions = handle.pipeline().subscribe();
    spawn_pcm_reader(std::io::Cursor::new(vec![0u8; 3840]), handle.pipeline().input(), None);
    handle.pipeline().play();
    let packet = server.recv_rtp().await;
    assert_eq!(packet.ssrc, 2000);
    assert_eq!(completions.recv().await.unwrap().outcome, ItemOutcome::Finished);

    handle.disconnect();
    handle.closed().await;
}

#[tokio::test]
async fn kicked_is_terminal() {
    let server = VoiceServer::bind().await;
    let gateway = start_gateway(server.endpoint()).await;
    let (joined, (mut peer, _)) = tokio::join!(join(&gateway), server.accept_session(1));
    let handle = joined.unwrap();

    peer.close(4014).await;
    let status = tokio::time::timeout(Duration::from_secs(5), handle.closed())
        .await
        .unwrap();
    assert!(matches!(status, VoiceStatus::Failed(_)));
    assert!(handle.pipeline().is_shutdown());
}

#[tokio::test]
async fn unsupported_modes_fail_the_join() {
    let server = VoiceServer::bind().await;
    let gateway = start_gateway(server.endpoint()).await;

    let fake = async {
        let mut peer = FakePeer::accept(&server.listener).await.unwrap();
        peer.send_json(json!({ "op": 8, "d": { "heartbeat_interval": 41_250.0 } })).await;
        peer.recv_op(0).await.unwrap();
        peer.send_json(json!({
            "op": 2,
            "d": { "ssrc": 1, "ip": "127.0.0.1", "port": 9, "modes": ["aead_aes256_gcm_rtpsize"] }
        }))
        .await;
        peer
    };
    let (joined, _peer) = tokio::join!(join(&gateway), fake);
    assert!(matches!(joined, Err(VoiceError::UnsupportedModes(_))));
}

#[tokio::test]
async fn join_before_ready_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/", listener.local_addr().unwrap());
    let rendezvous = VoiceRendezvous::new();
    let (connection, handle) =
        GatewayConnection::new(GatewaySettings::new("token").with_url(url), rendezvous.clone());
    tokio::spawn(connection.run());

    let result = VoiceConnection::join(
        handle.clone(),
        rendezvous,
        JoinRequest {
            guild_id: GUILD,
            channel_id: CHANNEL,
        },
        voice_settings(),
    )
    .await;
    assert!(matches!(result, Err(VoiceError::NotReady)));
    handle.shutdown();
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
