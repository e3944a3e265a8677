//! Wire protocol types for the Live API peer
//!
//! Outbound messages are serde structs wrapped manually into their
//! top-level envelope key; inbound messages are inspected as raw JSON by
//! the demultiplexer since a single message can carry several signals.

use crate::error::{Result, SessionError};
use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<serde_json::Value>,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LiveSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
}

impl LiveSetup {
    /// Setup for an audio-modality session with the given tool declarations.
    pub fn for_session(
        model: &str,
        system_instruction: Option<&str>,
        tools: Option<serde_json::Value>,
    ) -> Self {
        Self {
            model: model.to_string(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                temperature: None,
                speech_config: None,
            }),
            system_instruction: system_instruction.map(|text| {
                serde_json::json!({ "parts": [{ "text": text }] })
            }),
            tools,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeAudio {
    pub data: String,
    pub mime_type: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeVideo {
    pub data: String,
    pub mime_type: String,
}

/// A chunk of realtime input (audio or video).
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<RealtimeAudio>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<RealtimeVideo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_start: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_end: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

impl RealtimeInput {
    pub fn audio_chunk(pcm: &[u8], sample_rate: u32) -> Self {
        Self {
            audio: Some(RealtimeAudio {
                data: general_purpose::STANDARD.encode(pcm),
                mime_type: format!("audio/pcm;rate={}", sample_rate),
            }),
            ..Default::default()
        }
    }

    pub fn video_frame(jpeg: &[u8], mime_type: &str) -> Self {
        Self {
            video: Some(RealtimeVideo {
                data: general_purpose::STANDARD.encode(jpeg),
                mime_type: mime_type.to_string(),
            }),
            ..Default::default()
        }
    }
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum ClientMessage {
    Setup { setup: LiveSetup },
    RealtimeInput { realtime_input: RealtimeInput },
    ToolResponse { tool_response: serde_json::Value },
}

impl ClientMessage {
    /// Build a single function response acknowledging a tool call.
    pub fn tool_response(id: &str, name: &str, response: serde_json::Value) -> Self {
        ClientMessage::ToolResponse {
            tool_response: serde_json::json!({
                "functionResponses": [{
                    "id": id,
                    "name": name,
                    "response": response,
                }]
            }),
        }
    }

    /// Serialize to the wire envelope the peer expects.
    pub fn to_wire_json(&self) -> Result<String> {
        let json = match self {
            ClientMessage::Setup { setup } => {
                format!(
                    "{{\"setup\":{}}}",
                    serde_json::to_string(setup).map_err(SessionError::Serialization)?
                )
            }
            ClientMessage::RealtimeInput { realtime_input } => {
                format!(
                    "{{\"realtimeInput\":{}}}",
                    serde_json::to_string(realtime_input).map_err(SessionError::Serialization)?
                )
            }
            ClientMessage::ToolResponse { tool_response } => {
                format!(
                    "{{\"toolResponse\":{}}}",
                    serde_json::to_string(tool_response).map_err(SessionError::Serialization)?
                )
            }
        };
        Ok(json)
    }
}

/// Parse a sample rate out of a mime type like `audio/pcm;rate=24000`.
pub fn sample_rate_from_mime(mime_type: &str, default: u32) -> u32 {
    mime_type
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("rate="))
        .filter_map(|rate| rate.parse().ok())
        .next()
        .unwrap_or(default)
}
