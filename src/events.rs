//! Event types flowing between session components

use serde_json::Value;
use std::time::Instant;

/// A single tool invocation requested by the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    /// Unique per remote invocation; used for at-most-once dispatch.
    pub id: String,
    pub name: String,
    pub args: serde_json::Map<String, Value>,
}

/// Everything the peer can say to us, as a closed union.
///
/// Adding a server event kind without handling it everywhere is a compile
/// error, which is the point.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    SetupComplete,
    Text {
        content: String,
    },
    Audio {
        data: Vec<u8>,
        mime_type: String,
        sample_rate: u32,
    },
    ToolCall(Vec<ToolCallRequest>),
    TurnComplete,
    Interrupted,
    InputTranscription {
        text: String,
        finished: bool,
    },
    OutputTranscription {
        text: String,
        finished: bool,
    },
    ServerError(String),
}

/// Outbound media chunk queued by the pacer.
#[derive(Debug, Clone)]
pub enum OutboundMediaChunk {
    Frame {
        jpeg: Vec<u8>,
        mime_type: String,
        queued_at: Instant,
    },
    Audio {
        pcm: Vec<u8>,
        sample_rate: u32,
        queued_at: Instant,
    },
}

/// Media pushed by capture adapters. Adapters know nothing about the
/// session protocol; these are raw encoded chunks plus metering.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    Frame {
        jpeg: Vec<u8>,
        mime_type: String,
    },
    Audio {
        pcm: Vec<u8>,
        sample_rate: u32,
        /// Normalized loudness in [0, 1], computed at the capture site.
        level: f32,
    },
}

/// Coarse activity presented alongside level callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityStatus {
    Idle,
    Listening,
    Speaking,
}

/// Who produced a transcription update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptSource {
    User,
    Model,
}

/// Transcription text surfaced to the host.
#[derive(Debug, Clone)]
pub struct TranscriptUpdate {
    pub source: TranscriptSource,
    pub text: String,
    pub finished: bool,
}

/// Outcome of a finalize operation, delivered to the host once per subject.
#[derive(Debug, Clone)]
pub struct FinalizeResult {
    pub item_ref: String,
    pub success: bool,
    pub listing_id: Option<String>,
    pub artifact_url: Option<String>,
    pub error: Option<String>,
}
