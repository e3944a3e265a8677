//! Half-duplex coordination
//!
//! Tracks whether the peer is currently speaking so the microphone path can
//! be gated while synthesized audio plays. Capture itself never stops; the
//! session simply discards mic output while the flag is up, which keeps
//! level metering alive and avoids start/stop latency on unmute.

use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct HalfDuplex {
    speaking: bool,
    /// How long playback has to sit empty, with the flag still up, before
    /// a lost turn-complete is assumed.
    failsafe: Duration,
    idle_since: Option<Instant>,
}

impl HalfDuplex {
    pub fn new(failsafe: Duration) -> Self {
        Self {
            speaking: false,
            failsafe,
            idle_since: None,
        }
    }

    pub fn model_is_speaking(&self) -> bool {
        self.speaking
    }

    /// First audio chunk since the last reset marks the peer as speaking.
    pub fn on_model_audio(&mut self) {
        if !self.speaking {
            debug!("peer started speaking, muting microphone path");
        }
        self.speaking = true;
        self.idle_since = None;
    }

    pub fn on_turn_complete(&mut self) {
        if self.speaking {
            debug!("turn complete, unmuting microphone path");
        }
        self.speaking = false;
        self.idle_since = None;
    }

    /// Handle a peer interruption signal. Returns true when the signal was
    /// acted on; an interruption while the peer was not speaking is
    /// spurious (the peer emits these after tool acknowledgments) and is
    /// ignored entirely.
    pub fn on_interrupted(&mut self) -> bool {
        if !self.speaking {
            debug!("ignoring spurious interruption while peer is silent");
            return false;
        }
        self.speaking = false;
        self.idle_since = None;
        true
    }

    /// Fail-safe: called periodically with the playback queue's idleness.
    /// Returns true when a stuck speaking flag was forcibly cleared.
    pub fn poll_failsafe(&mut self, playback_idle: bool, now: Instant) -> bool {
        if !self.speaking {
            self.idle_since = None;
            return false;
        }
        if !playback_idle {
            self.idle_since = None;
            return false;
        }

        let since = *self.idle_since.get_or_insert(now);
        if now.duration_since(since) >= self.failsafe {
            warn!("turn completion never arrived, force-unmuting microphone");
            self.speaking = false;
            self.idle_since = None;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.speaking = false;
        self.idle_since = None;
    }
}
