//! External address discovery over the voice UDP socket.
//!
//! ```text
//! Bytes 0-1:   Type (u16, 0x1 request / 0x2 response)
//! Bytes 2-3:   Length (u16, 70)
//! Bytes 4-7:   SSRC (u32)
//! Bytes 8-71:  Address, NUL-terminated ASCII (zero in the request)
//! Bytes 72-73: Port (u16)
//! ```

use bytes::{Buf, BufMut};
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

use crate::TransportError;

pub const PACKET_SIZE: usize = 74;
const REQUEST_TYPE: u16 = 0x1;
const BODY_LENGTH: u16 = 70;
const ADDRESS_START: usize = 8;
const ADDRESS_END: usize = 72;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredAddress {
    pub ip: IpAddr,
    pub port: u16,
}

pub fn build_request(ssrc: u32) -> [u8; PACKET_SIZE] {
    let mut packet = [0u8; PACKET_SIZE];
    let mut buf = &mut packet[..];
    buf.put_u16(REQUEST_TYPE);
    buf.put_u16(BODY_LENGTH);
    buf.put_u32(ssrc);
    packet
}

pub fn parse_response(packet: &[u8]) -> Result<DiscoveredAddress, TransportError> {
    if packet.len() < PACKET_SIZE {
        return Err(TransportError::BufferTooShort {
            expected: PACKET_SIZE,
            actual: packet.len(),
        });
    }

    let raw = &packet[ADDRESS_START..ADDRESS_END];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let ip = std::str::from_utf8(&raw[..end])
        .map_err(|_| TransportError::DiscoveryMalformed("address is not ascii"))?
        .parse::<IpAddr>()
        .map_err(|_| TransportError::DiscoveryMalformed("address is not an ip"))?;
    let port = (&packet[ADDRESS_END..PACKET_SIZE]).get_u16();
    Ok(DiscoveredAddress { ip, port })
}

/// Send one discovery request on a connected socket and wait for the reply.
pub async fn discover(
    socket: &UdpSocket,
    ssrc: u32,
    timeout: Duration,
) -> Result<DiscoveredAddress, TransportError> {
    socket.send(&build_request(ssrc)).await?;

    let mut buf = [0u8; 2048];
    let len = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| TransportError::DiscoveryTimeout(timeout))??;
    let address = parse_response(&buf[..len])?;
    tracing::debug!(ip = %address.ip, port = address.port, ssrc, "ip discovery complete");
    Ok(address)
}
