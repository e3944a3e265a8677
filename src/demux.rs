//! Inbound event demultiplexer
//!
//! Classifies raw peer messages into the closed [`InboundEvent`] union.
//! The peer is observed to re-deliver audio chunks (sometimes via both the
//! direct and the structured content path), to resend tool calls, and to
//! re-signal turn completion, so all three are deduplicated here before
//! any consumer sees them. Unknown or malformed messages are logged and
//! dropped, never raised.

use crate::events::{InboundEvent, ToolCallRequest};
use crate::wire::sample_rate_from_mime;
use base64::engine::general_purpose;
use base64::Engine;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DEFAULT_OUTPUT_RATE: u32 = 24000;
/// Ring capacity for the audio recency window.
const AUDIO_WINDOW_CAP: usize = 64;
/// Upper bound on remembered tool-call IDs for the session lifetime.
const PROCESSED_IDS_CAP: usize = 256;
/// How much payload feeds the dedup key alongside the length.
const AUDIO_KEY_PREFIX: usize = 64;

pub struct EventDemux {
    audio_window: Duration,
    turn_cooldown: Duration,

    /// Recently seen audio keys, oldest first. Evicted opportunistically on
    /// each insert; bounded as a ring regardless of timing.
    audio_seen: VecDeque<(u64, Instant)>,
    processed_ids: HashSet<String>,
    processed_order: VecDeque<String>,
    last_turn_complete: Option<Instant>,
}

impl EventDemux {
    pub fn new(audio_window: Duration, turn_cooldown: Duration) -> Self {
        Self {
            audio_window,
            turn_cooldown,
            audio_seen: VecDeque::new(),
            processed_ids: HashSet::new(),
            processed_order: VecDeque::new(),
            last_turn_complete: None,
        }
    }

    /// Classify one raw message into zero or more events, in the order the
    /// peer expressed them. A single message can carry a tool call and a
    /// turn-complete signal at once.
    pub fn ingest(&mut self, raw: &str, now: Instant) -> Vec<InboundEvent> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!("dropping unparseable peer message: {}", e);
                return Vec::new();
            }
        };

        let mut events = Vec::new();

        if value.get("setupComplete").is_some() {
            events.push(InboundEvent::SetupComplete);
        }

        if let Some(tool_call) = value.get("toolCall") {
            if let Some(event) = self.classify_tool_call(tool_call) {
                events.push(event);
            }
        }

        // Direct audio payload, outside structured content.
        if let Some(audio) = value.get("audio") {
            if let Some(event) = self.classify_audio(audio, now) {
                events.push(event);
            }
        }

        if let Some(content) = value.get("serverContent") {
            self.classify_server_content(content, now, &mut events);
        }

        if let Some(error) = value.get("error") {
            let detail = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unspecified peer error")
                .to_string();
            events.push(InboundEvent::ServerError(detail));
        }

        if value.get("goAway").is_some() {
            events.push(InboundEvent::ServerError("peer signalled goAway".to_string()));
        }

        if events.is_empty() {
            debug!("peer message produced no events");
        }
        events
    }

    /// Release all session-scoped dedup state.
    pub fn reset(&mut self) {
        self.audio_seen.clear();
        self.processed_ids.clear();
        self.processed_order.clear();
        self.last_turn_complete = None;
    }

    fn classify_server_content(&mut self, content: &Value, now: Instant, events: &mut Vec<InboundEvent>) {
        if let Some(t) = content.get("inputTranscription") {
            if let Some(text) = t.get("text").and_then(|x| x.as_str()) {
                if !text.is_empty() {
                    events.push(InboundEvent::InputTranscription {
                        text: text.to_string(),
                        finished: transcription_finished(t),
                    });
                }
            }
        }

        if let Some(t) = content.get("outputTranscription") {
            if let Some(text) = t.get("text").and_then(|x| x.as_str()) {
                if !text.is_empty() {
                    events.push(InboundEvent::OutputTranscription {
                        text: text.to_string(),
                        finished: transcription_finished(t),
                    });
                }
            }
        }

        if let Some(parts) = content
            .get("modelTurn")
            .and_then(|turn| turn.get("parts"))
            .and_then(|p| p.as_array())
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        events.push(InboundEvent::Text {
                            content: text.to_string(),
                        });
                    }
                } else if let Some(inline) = part.get("inlineData") {
                    if let Some(event) = self.classify_audio(inline, now) {
                        events.push(event);
                    }
                }
            }
        }

        if content.get("interrupted").and_then(|i| i.as_bool()) == Some(true) {
            events.push(InboundEvent::Interrupted);
        }

        if content.get("turnComplete").and_then(|t| t.as_bool()) == Some(true) {
            if self.turn_complete_allowed(now) {
                self.last_turn_complete = Some(now);
                events.push(InboundEvent::TurnComplete);
            } else {
                debug!("absorbing redundant turnComplete inside cooldown");
            }
        }
    }

    fn classify_audio(&mut self, blob: &Value, now: Instant) -> Option<InboundEvent> {
        let data_b64 = blob.get("data").and_then(|d| d.as_str())?;
        let mime_type = blob
            .get("mimeType")
            .and_then(|m| m.as_str())
            .unwrap_or("audio/pcm")
            .to_string();
        if !mime_type.starts_with("audio/") {
            debug!(mime_type, "ignoring non-audio inline data");
            return None;
        }

        let data = match general_purpose::STANDARD.decode(data_b64) {
            Ok(d) => d,
            Err(e) => {
                warn!("dropping audio chunk with invalid base64: {}", e);
                return None;
            }
        };
        if data.is_empty() {
            return None;
        }

        let key = audio_key(&data);
        if self.audio_seen_recently(key, now) {
            debug!("absorbing duplicate audio chunk inside recency window");
            return None;
        }
        self.remember_audio(key, now);

        let sample_rate = sample_rate_from_mime(&mime_type, DEFAULT_OUTPUT_RATE);
        Some(InboundEvent::Audio {
            data,
            mime_type,
            sample_rate,
        })
    }

    fn classify_tool_call(&mut self, tool_call: &Value) -> Option<InboundEvent> {
        let calls = tool_call.get("functionCalls").and_then(|c| c.as_array())?;

        let mut requests = Vec::new();
        for call in calls {
            let id = call.get("id").and_then(|i| i.as_str()).unwrap_or("").to_string();
            let name = match call.get("name").and_then(|n| n.as_str()) {
                Some(n) => n.to_string(),
                None => {
                    warn!("dropping tool call without a name");
                    continue;
                }
            };
            if !id.is_empty() && !self.mark_processed(&id) {
                debug!(id, name, "absorbing resent tool call");
                continue;
            }
            let args = call
                .get("args")
                .and_then(|a| a.as_object())
                .cloned()
                .unwrap_or_default();
            requests.push(ToolCallRequest { id, name, args });
        }

        if requests.is_empty() {
            None
        } else {
            Some(InboundEvent::ToolCall(requests))
        }
    }

    fn turn_complete_allowed(&self, now: Instant) -> bool {
        match self.last_turn_complete {
            Some(last) => now.duration_since(last) >= self.turn_cooldown,
            None => true,
        }
    }

    fn audio_seen_recently(&self, key: u64, now: Instant) -> bool {
        self.audio_seen
            .iter()
            .any(|(k, at)| *k == key && now.duration_since(*at) < self.audio_window)
    }

    fn remember_audio(&mut self, key: u64, now: Instant) {
        while let Some((_, at)) = self.audio_seen.front() {
            if now.duration_since(*at) >= self.audio_window {
                self.audio_seen.pop_front();
            } else {
                break;
            }
        }
        if self.audio_seen.len() >= AUDIO_WINDOW_CAP {
            self.audio_seen.pop_front();
        }
        self.audio_seen.push_back((key, now));
    }

    /// Returns false when the ID was already processed.
    fn mark_processed(&mut self, id: &str) -> bool {
        if self.processed_ids.contains(id) {
            return false;
        }
        if self.processed_order.len() >= PROCESSED_IDS_CAP {
            if let Some(evicted) = self.processed_order.pop_front() {
                self.processed_ids.remove(&evicted);
            }
        }
        self.processed_ids.insert(id.to_string());
        self.processed_order.push_back(id.to_string());
        true
    }
}

fn transcription_finished(t: &Value) -> bool {
    t.get("isFinal")
        .or_else(|| t.get("finished"))
        .and_then(|f| f.as_bool())
        .unwrap_or(false)
}

fn audio_key(data: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    data.len().hash(&mut hasher);
    data[..data.len().min(AUDIO_KEY_PREFIX)].hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demux() -> EventDemux {
        EventDemux::new(Duration::from_millis(100), Duration::from_secs(1))
    }

    fn audio_message(payload: &[u8]) -> String {
        serde_json::json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [{
                        "inlineData": {
                            "mimeType": "audio/pcm;rate=24000",
                            "data": general_purpose::STANDARD.encode(payload),
                        }
                    }]
                }
            }
        })
        .to_string()
    }

    #[test]
    fn setup_complete_is_detected() {
        let mut d = demux();
        let events = d.ingest(r#"{"setupComplete": {}}"#, Instant::now());
        assert!(matches!(events.as_slice(), [InboundEvent::SetupComplete]));
    }

    #[test]
    fn duplicate_audio_inside_window_is_absorbed() {
        let mut d = demux();
        let t0 = Instant::now();
        let msg = audio_message(&[1u8; 128]);

        assert_eq!(d.ingest(&msg, t0).len(), 1);
        assert_eq!(d.ingest(&msg, t0 + Duration::from_millis(50)).len(), 0);
    }

    #[test]
    fn duplicate_audio_outside_window_passes() {
        let mut d = demux();
        let t0 = Instant::now();
        let msg = audio_message(&[1u8; 128]);

        assert_eq!(d.ingest(&msg, t0).len(), 1);
        assert_eq!(d.ingest(&msg, t0 + Duration::from_millis(150)).len(), 1);
    }

    #[test]
    fn distinct_audio_same_length_passes() {
        let mut d = demux();
        let t0 = Instant::now();

        assert_eq!(d.ingest(&audio_message(&[1u8; 128]), t0).len(), 1);
        assert_eq!(d.ingest(&audio_message(&[2u8; 128]), t0).len(), 1);
    }

    #[test]
    fn direct_and_nested_audio_paths_share_the_dedup_window() {
        let mut d = demux();
        let t0 = Instant::now();
        let payload = [7u8; 96];

        let direct = serde_json::json!({
            "audio": {
                "mimeType": "audio/pcm;rate=24000",
                "data": general_purpose::STANDARD.encode(payload),
            }
        })
        .to_string();

        assert_eq!(d.ingest(&direct, t0).len(), 1);
        // Equivalent chunk arriving through structured content is absorbed.
        assert_eq!(d.ingest(&audio_message(&payload), t0 + Duration::from_millis(20)).len(), 0);
    }

    #[test]
    fn resent_tool_call_id_is_absorbed() {
        let mut d = demux();
        let msg = serde_json::json!({
            "toolCall": {
                "functionCalls": [{"id": "call-1", "name": "finalize_listing", "args": {}}]
            }
        })
        .to_string();

        let first = d.ingest(&msg, Instant::now());
        assert!(matches!(first.as_slice(), [InboundEvent::ToolCall(calls)] if calls.len() == 1));
        assert!(d.ingest(&msg, Instant::now()).is_empty());
    }

    #[test]
    fn turn_complete_cooldown_absorbs_resignal() {
        let mut d = demux();
        let t0 = Instant::now();
        let msg = r#"{"serverContent": {"turnComplete": true}}"#;

        assert_eq!(d.ingest(msg, t0).len(), 1);
        assert_eq!(d.ingest(msg, t0 + Duration::from_millis(300)).len(), 0);
        assert_eq!(d.ingest(msg, t0 + Duration::from_millis(1200)).len(), 1);
    }

    #[test]
    fn one_message_can_carry_audio_and_turn_complete() {
        let mut d = demux();
        let msg = serde_json::json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [{
                        "inlineData": {
                            "mimeType": "audio/pcm;rate=24000",
                            "data": general_purpose::STANDARD.encode([3u8; 64]),
                        }
                    }]
                },
                "turnComplete": true
            }
        })
        .to_string();

        let events = d.ingest(&msg, Instant::now());
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], InboundEvent::Audio { .. }));
        assert!(matches!(events[1], InboundEvent::TurnComplete));
    }

    #[test]
    fn malformed_messages_are_dropped() {
        let mut d = demux();
        assert!(d.ingest("not json at all", Instant::now()).is_empty());
        assert!(d.ingest(r#"{"unknownKey": 1}"#, Instant::now()).is_empty());
    }

    #[test]
    fn transcriptions_are_classified() {
        let mut d = demux();
        let msg = serde_json::json!({
            "serverContent": {
                "inputTranscription": {"text": "hello there", "isFinal": true}
            }
        })
        .to_string();

        let events = d.ingest(&msg, Instant::now());
        match events.as_slice() {
            [InboundEvent::InputTranscription { text, finished }] => {
                assert_eq!(text, "hello there");
                assert!(finished);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn reset_clears_processed_ids() {
        let mut d = demux();
        let msg = serde_json::json!({
            "toolCall": {
                "functionCalls": [{"id": "call-1", "name": "finalize_listing", "args": {}}]
            }
        })
        .to_string();

        assert_eq!(d.ingest(&msg, Instant::now()).len(), 1);
        d.reset();
        assert_eq!(d.ingest(&msg, Instant::now()).len(), 1);
    }

    #[test]
    fn interrupted_is_classified() {
        let mut d = demux();
        let events = d.ingest(r#"{"serverContent": {"interrupted": true}}"#, Instant::now());
        assert!(matches!(events.as_slice(), [InboundEvent::Interrupted]));
    }
}
