//! WebSocket plumbing shared by the gateway and voice sockets: frame codec,
//! HTTP upgrade, TCP/TLS transport and heartbeat bookkeeping.

pub mod frame;
pub mod handshake;
pub mod heartbeat;
pub mod stream;
pub mod wire;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use frame::{Frame, FrameCodec, FrameError, OpCode, Role};
pub use heartbeat::{Beat, HeartbeatSupervisor};
pub use stream::{connect, ConnectError, ConnectSettings, Endpoint, WsFramed, WsStream};
