//! merchlive - live listing session over a multimodal inference peer
//!
//! Connects a device's camera and microphone to a remote multimodal model
//! through one bidirectional WebSocket, plays the model's synthesized
//! speech, and executes its tool calls (capture a reference photo, finalize
//! the item into a persisted listing) in the background without stalling
//! the conversation.

#![forbid(unsafe_code)]

/// Session configuration knobs
pub mod config;
/// Inbound message classification and deduplication
pub mod demux;
/// Error type shared across the session
pub mod error;
/// Event types flowing between components
pub mod events;
/// Half-duplex microphone gating
pub mod halfduplex;
/// Camera and microphone capture adapters
pub mod media_in;
/// Outbound media throttling and buffering
pub mod pacer;
/// Background listing pipeline contract
pub mod pipeline;
/// Playback queue and backpressure
pub mod playback;
/// Host-facing session facade
pub mod session;
/// Tool-call orchestration
pub mod tools;
/// WebSocket transport and connection state machine
pub mod transport;
/// Peer wire protocol types
pub mod wire;

pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use events::{ActivityStatus, FinalizeResult, InboundEvent, MediaEvent, ToolCallRequest};
pub use pipeline::{ListingOutcome, ListingPipeline, ListingRequest, ReferenceImage};
pub use playback::{AudioSink, NullSink};
pub use session::{LiveSession, SessionCallbacks};
pub use transport::SessionState;
