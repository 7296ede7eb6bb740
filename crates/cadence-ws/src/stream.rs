use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Framed, FramedParts};
use url::Url;

use crate::frame::{Frame, FrameCodec, DEFAULT_MAX_PAYLOAD};
use crate::handshake::{client_handshake, HandshakeError};

pub type WsFramed = Framed<WsStream, FrameCodec>;

static TLS_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid dns name: {0}")]
    InvalidDnsName(String),
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}

/// A parsed `ws://` or `wss://` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`.
    pub path: String,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, ConnectError> {
        let url = Url::parse(raw)?;
        let secure = match url.scheme() {
            "wss" => true,
            "ws" => false,
            other => return Err(ConnectError::UnsupportedScheme(other.to_string())),
        };
        let host = url
            .host_str()
            .ok_or(ConnectError::InvalidUrl(url::ParseError::EmptyHost))?
            .to_string();
        let port = url.port().unwrap_or(if secure { 443 } else { 80 });
        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(Self {
            secure,
            host,
            port,
            path,
        })
    }

    /// Value for the `Host` header; default ports are omitted.
    pub fn host_header(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

pub enum WsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for WsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            WsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            WsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            WsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            WsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            WsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectSettings {
    /// Covers TCP connect, TLS and the upgrade together.
    pub timeout: Duration,
    pub max_payload: usize,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

fn tls_config() -> Result<Arc<ClientConfig>, ConnectError> {
    if let Some(config) = TLS_CONFIG.get() {
        return Ok(config.clone());
    }
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(TLS_CONFIG.get_or_init(|| Arc::new(config)).clone())
}

/// Open a TCP (and TLS for `wss`) connection, perform the upgrade and wrap
/// the stream in a client-role frame codec.
pub async fn connect(url: &str, settings: ConnectSettings) -> Result<WsFramed, ConnectError> {
    let endpoint = Endpoint::parse(url)?;
    tokio::time::timeout(settings.timeout, connect_endpoint(&endpoint, settings))
        .await
        .map_err(|_| ConnectError::Timeout(settings.timeout))?
}

async fn connect_endpoint(
    endpoint: &Endpoint,
    settings: ConnectSettings,
) -> Result<WsFramed, ConnectError> {
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    tcp.set_nodelay(true)?;

    let mut stream = if endpoint.secure {
        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|_| ConnectError::InvalidDnsName(endpoint.host.clone()))?;
        let connector = TlsConnector::from(tls_config()?);
        WsStream::Tls(Box::new(connector.connect(server_name, tcp).await?))
    } else {
        WsStream::Plain(tcp)
    };

    let leftover = client_handshake(&mut stream, &endpoint.host_header(), &endpoint.path).await?;
    tracing::debug!(host = %endpoint.host, port = endpoint.port, secure = endpoint.secure, "websocket connected");

    let codec = FrameCodec::client().with_max_payload(settings.max_payload);
    let mut parts = FramedParts::new::<Frame>(stream, codec);
    parts.read_buf = leftover;
    Ok(Framed::from_parts(parts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_secure_endpoint_with_query() {
        let ep = Endpoint::parse("wss://gateway.example.gg/?v=10&encoding=json").unwrap();
        assert!(ep.secure);
        assert_eq!(ep.host, "gateway.example.gg");
        assert_eq!(ep.port, 443);
        assert_eq!(ep.path, "/?v=10&encoding=json");
        assert_eq!(ep.host_header(), "gateway.example.gg");
    }

    #[test]
    fn plain_endpoint_keeps_explicit_port() {
        let ep = Endpoint::parse("ws://127.0.0.1:9001").unwrap();
        assert!(!ep.secure);
        assert_eq!(ep.port, 9001);
        assert_eq!(ep.path, "/");
        assert_eq!(ep.host_header(), "127.0.0.1:9001");
    }

    #[test]
    fn rejects_http_scheme() {
        assert!(matches!(
            Endpoint::parse("https://example.com"),
            Err(ConnectError::UnsupportedScheme(_))
        ));
    }
}
