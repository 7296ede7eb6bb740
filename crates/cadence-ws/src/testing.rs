//! Loopback server pieces for exercising socket clients in tests.

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_util::codec::{Framed, FramedParts};

use crate::frame::{Frame, FrameCodec, OpCode};

/// Read a client upgrade request and answer with `101`.
/// Returns the request head and any bytes after it.
pub async fn accept_upgrade(stream: &mut TcpStream) -> std::io::Result<(String, BytesMut)> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf.split_to(pos + 4)).into_owned();
            let key = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("sec-websocket-key")
                        .then(|| value.trim().to_string())
                })
                .ok_or(std::io::ErrorKind::InvalidData)?;
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\r\n",
                derive_accept_key(key.as_bytes())
            );
            stream.write_all(response.as_bytes()).await?;
            return Ok((head, buf));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
    }
}

/// Server end of one upgraded connection.
pub struct FakePeer {
    framed: Framed<TcpStream, FrameCodec>,
    pub request_head: String,
}

impl FakePeer {
    pub async fn accept(listener: &TcpListener) -> std::io::Result<Self> {
        let (mut stream, _) = listener.accept().await?;
        let (request_head, leftover) = accept_upgrade(&mut stream).await?;
        let mut parts = FramedParts::new::<Frame>(stream, FrameCodec::server());
        parts.read_buf = leftover;
        Ok(Self {
            framed: Framed::from_parts(parts),
            request_head,
        })
    }

    pub async fn send_json(&mut self, value: Value) {
        let _ = self.framed.send(Frame::text(value.to_string())).await;
    }

    pub async fn send_frame(&mut self, frame: Frame) {
        let _ = self.framed.send(frame).await;
    }

    pub async fn close(&mut self, code: u16) {
        let _ = self.framed.send(Frame::close(code, "")).await;
    }

    /// Next frame from the client, or `None` once the socket ends.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        match self.framed.next().await {
            Some(Ok(frame)) => Some(frame),
            _ => None,
        }
    }

    /// Next text message decoded as JSON. Control frames are skipped.
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            let frame = self.recv_frame().await?;
            match frame.opcode {
                OpCode::Text | OpCode::Binary => {
                    return serde_json::from_slice(&frame.payload).ok();
                }
                OpCode::Close => return None,
                _ => continue,
            }
        }
    }

    /// Next JSON message with the given `op`, skipping others.
    pub async fn recv_op(&mut self, op: u64) -> Option<Value> {
        loop {
            let msg = self.recv_json().await?;
            if msg.get("op").and_then(Value::as_u64) == Some(op) {
                return Some(msg);
            }
        }
    }

    /// Like [`FakePeer::recv_json`] with a deadline.
    pub async fn recv_json_within(&mut self, limit: Duration) -> Option<Value> {
        tokio::time::timeout(limit, self.recv_json()).await.ok().flatten()
    }
}
