//! Client context tying the gateway, voice and interaction correlation
//! together.

pub mod client;
pub mod correlator;
pub mod error;
pub mod events;
pub mod responder;
pub mod router;

pub use client::{Client, ClientSettings};
pub use correlator::{
    Collect, Collected, Correlator, CorrelatorSettings, InteractionKind, Outcome, Wait,
};
pub use error::CoreError;
pub use events::{EventBus, GatewayEvent};
pub use responder::{HttpResponder, InteractionResponder, OutgoingResponse};
pub use router::DispatchRouter;
