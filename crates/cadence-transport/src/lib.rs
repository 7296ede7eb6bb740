//! Voice UDP transport: RTP framing, IP discovery, sealed outbound frames
//! and inbound packet opening.

pub mod discovery;
pub mod error;
pub mod inbound;
pub mod outbound;
pub mod rtp;
pub mod udp;

pub use discovery::{discover, DiscoveredAddress};
pub use error::TransportError;
pub use inbound::{open_packet, InboundPacket};
pub use outbound::{SendStats, VoiceSender};
pub use rtp::{RtpContext, RtpHeader};
pub use udp::connect_udp;
