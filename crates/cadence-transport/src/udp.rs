use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

use crate::TransportError;

/// Bind an ephemeral local port matching the family of `ip` and connect it
/// to the voice server.
pub async fn connect_udp(ip: IpAddr, port: u16) -> Result<UdpSocket, TransportError> {
    let local: SocketAddr = match ip {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect((ip, port)).await?;
    tracing::debug!(remote = %SocketAddr::new(ip, port), local = ?socket.local_addr().ok(), "voice udp connected");
    Ok(socket)
}
