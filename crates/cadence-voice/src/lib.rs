//! Voice: join signaling, the per-guild voice connection, and the paced
//! audio pipeline feeding it.

pub mod connection;
pub mod error;
pub mod pacer;
pub mod pipeline;
pub mod receiver;
pub mod rendezvous;
pub mod signaling;
pub mod source;

pub use connection::{VoiceConnection, VoiceHandle, VoiceStatus};
pub use error::VoiceError;
pub use pacer::{Pacer, PacerStats, FRAME_PERIOD};
pub use pipeline::{
    AudioFrame, AudioPipeline, Completion, FramePayload, FrameTag, ItemOutcome, PipelineHandle,
    PipelineInput, PipelineSettings, PipelineState, PipelineStats,
};
pub use receiver::VoicePacket;
pub use rendezvous::{VoiceRendezvous, VoiceServerInfo};
pub use signaling::{JoinRequest, VoiceSettings};
pub use source::{spawn_http_source, spawn_pcm_reader, SourceEnd};
