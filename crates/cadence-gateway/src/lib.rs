//! Control-plane gateway connection: handshake, heartbeats, sequence
//! tracking, resume and bounded reconnects.

pub mod bootstrap;
pub mod connection;
pub mod error;
pub mod reconnect;
pub mod session;

pub use connection::{
    DispatchSink, GatewayConnection, GatewayHandle, GatewaySettings, GatewayState, SessionInfo,
};
pub use error::GatewayError;
pub use reconnect::{ReconnectPolicy, ReconnectState};
pub use session::ConnectionSession;
