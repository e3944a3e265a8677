//! Session configuration

use std::time::Duration;

/// Configuration for a live listing session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Full WebSocket endpoint URL (including authentication query).
    pub url: String,
    /// Model to request in the setup message.
    pub model: String,
    /// System instruction sent with setup.
    pub system_instruction: Option<String>,

    /// Minimum interval between outbound camera frames.
    pub frame_interval: Duration,
    /// Minimum interval between outbound audio chunks.
    pub audio_interval: Duration,
    /// Per-kind cap on chunks buffered before setup completes.
    pub pre_setup_buffer: usize,

    /// Queued audio required before playback starts.
    pub playback_prebuffer: Duration,
    /// Queued audio beyond which the whole queue is cleared.
    pub playback_max_queued: Duration,

    /// Recency window for inbound audio deduplication.
    pub audio_dedup_window: Duration,
    /// Cooldown during which repeated turn-complete signals are absorbed.
    pub turn_complete_cooldown: Duration,
    /// How long playback may sit idle before a lost turn-complete is assumed
    /// and the microphone is force-unmuted.
    pub speaking_failsafe: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: "models/gemini-2.0-flash-live-001".to_string(),
            system_instruction: None,
            frame_interval: Duration::from_millis(1000),
            audio_interval: Duration::from_millis(100),
            pre_setup_buffer: 10,
            playback_prebuffer: Duration::from_millis(220),
            playback_max_queued: Duration::from_millis(3500),
            audio_dedup_window: Duration::from_millis(100),
            turn_complete_cooldown: Duration::from_secs(1),
            speaking_failsafe: Duration::from_millis(1500),
        }
    }
}

impl SessionConfig {
    /// Build a config pointing at the hosted Live API endpoint for `api_key`.
    pub fn from_api_key(api_key: &str) -> Self {
        Self {
            url: format!(
                "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent?key={}",
                api_key
            ),
            ..Default::default()
        }
    }
}
