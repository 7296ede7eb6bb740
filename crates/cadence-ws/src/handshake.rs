//! Client side of the HTTP/1.1 upgrade.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

const MAX_RESPONSE_HEAD: usize = 16 * 1024;
const MAX_RESPONSE_HEADERS: usize = 32;
const READ_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed during upgrade")]
    Closed,
    #[error("upgrade response exceeds {MAX_RESPONSE_HEAD} bytes")]
    ResponseTooLarge,
    #[error("malformed upgrade response: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("server refused upgrade with status {0}")]
    Status(u16),
    #[error("upgrade response missing or wrong {0} header")]
    Header(&'static str),
}

/// 16 random bytes, base64 encoded.
pub fn generate_key() -> String {
    let raw: [u8; 16] = rand::random();
    STANDARD.encode(raw)
}

pub fn build_request(host: &str, path: &str, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         User-Agent: cadence/{}\r\n\
         \r\n",
        env!("CARGO_PKG_VERSION")
    )
}

/// A parsed response head and its length in bytes.
struct ResponseHead {
    len: usize,
    status: u16,
    upgrade: Option<String>,
    accept: Option<String>,
}

fn parse_head(buf: &[u8]) -> Result<Option<ResponseHead>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let len = match response.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };
    let header = |name: &str| {
        response
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .map(|v| v.trim().to_string())
    };
    Ok(Some(ResponseHead {
        len,
        status: response.code.unwrap_or_default(),
        upgrade: header("Upgrade"),
        accept: header("Sec-WebSocket-Accept"),
    }))
}

fn verify(head: &ResponseHead, key: &str) -> Result<(), HandshakeError> {
    if head.status != 101 {
        return Err(HandshakeError::Status(head.status));
    }
    if !head
        .upgrade
        .as_deref()
        .is_some_and(|u| u.eq_ignore_ascii_case("websocket"))
    {
        return Err(HandshakeError::Header("Upgrade"));
    }
    if head.accept.as_deref() != Some(derive_accept_key(key.as_bytes()).as_str()) {
        return Err(HandshakeError::Header("Sec-WebSocket-Accept"));
    }
    Ok(())
}

/// Perform the upgrade and return any bytes the server sent after the
/// response head. Those belong to the first frames.
pub async fn client_handshake<S>(
    stream: &mut S,
    host: &str,
    path: &str,
) -> Result<BytesMut, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let request = build_request(host, path, &key);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let head = loop {
        if let Some(head) = parse_head(&buf)? {
            break head;
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(HandshakeError::ResponseTooLarge);
        }
        buf.reserve(READ_CHUNK);
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(HandshakeError::Closed);
        }
    };

    verify(&head, &key)?;
    let _ = buf.split_to(head.len);
    tracing::debug!(host, path, "websocket upgrade accepted");
    Ok(buf)
}
