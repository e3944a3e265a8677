//! Outbound media pacer
//!
//! Throttles camera frames and microphone audio to configured intervals and
//! holds a small bounded window of chunks while the session is still
//! setting up. Frames that arrive too fast are stale by definition and are
//! dropped rather than queued; audio is small and order matters, so it is
//! queued instead.

use crate::events::OutboundMediaChunk;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

pub struct MediaPacer {
    frame_interval: Duration,
    audio_interval: Duration,
    buffer_cap: usize,

    last_frame_at: Option<Instant>,
    last_audio_at: Option<Instant>,

    /// Chunks held until setup completes (per kind, oldest dropped).
    pending_frames: VecDeque<OutboundMediaChunk>,
    pending_audio: VecDeque<OutboundMediaChunk>,

    /// Audio waiting out the inter-emission interval while ready.
    throttled_audio: VecDeque<OutboundMediaChunk>,
}

impl MediaPacer {
    pub fn new(frame_interval: Duration, audio_interval: Duration, buffer_cap: usize) -> Self {
        Self {
            frame_interval,
            audio_interval,
            buffer_cap,
            last_frame_at: None,
            last_audio_at: None,
            pending_frames: VecDeque::new(),
            pending_audio: VecDeque::new(),
            throttled_audio: VecDeque::new(),
        }
    }

    /// Submit a camera frame. Returns the chunk to forward, or `None` when
    /// the frame was dropped (throttled) or buffered (setup pending).
    pub fn submit_frame(
        &mut self,
        jpeg: Vec<u8>,
        mime_type: &str,
        ready: bool,
        now: Instant,
    ) -> Option<OutboundMediaChunk> {
        let chunk = OutboundMediaChunk::Frame {
            jpeg,
            mime_type: mime_type.to_string(),
            queued_at: now,
        };

        if !ready {
            push_bounded(&mut self.pending_frames, chunk, self.buffer_cap);
            return None;
        }

        if let Some(last) = self.last_frame_at {
            if now.duration_since(last) < self.frame_interval {
                debug!("dropping frame inside throttle interval");
                return None;
            }
        }

        self.last_frame_at = Some(now);
        Some(chunk)
    }

    /// Submit an audio chunk. Returns the chunks to forward now, in order;
    /// empty when the chunk was buffered or is waiting out the interval.
    pub fn submit_audio(
        &mut self,
        pcm: Vec<u8>,
        sample_rate: u32,
        ready: bool,
        now: Instant,
    ) -> Vec<OutboundMediaChunk> {
        let chunk = OutboundMediaChunk::Audio {
            pcm,
            sample_rate,
            queued_at: now,
        };

        if !ready {
            push_bounded(&mut self.pending_audio, chunk, self.buffer_cap);
            return Vec::new();
        }

        self.throttled_audio.push_back(chunk);

        if let Some(last) = self.last_audio_at {
            if now.duration_since(last) < self.audio_interval {
                return Vec::new();
            }
        }

        self.last_audio_at = Some(now);
        self.throttled_audio.drain(..).collect()
    }

    /// Flush everything buffered while setup was pending. Only the most
    /// recent frame survives (older frames are stale); all audio flushes in
    /// submission order.
    pub fn flush(&mut self, now: Instant) -> Vec<OutboundMediaChunk> {
        let mut out = Vec::new();

        if let Some(frame) = self.pending_frames.pop_back() {
            let dropped = self.pending_frames.len();
            if dropped > 0 {
                debug!(dropped, "discarding stale buffered frames on flush");
            }
            self.pending_frames.clear();
            self.last_frame_at = Some(now);
            out.push(frame);
        }

        if !self.pending_audio.is_empty() {
            self.last_audio_at = Some(now);
            out.extend(self.pending_audio.drain(..));
        }

        out
    }

    /// Drop all buffered state (session teardown).
    pub fn clear(&mut self) {
        self.pending_frames.clear();
        self.pending_audio.clear();
        self.throttled_audio.clear();
        self.last_frame_at = None;
        self.last_audio_at = None;
    }

    pub fn buffered(&self) -> usize {
        self.pending_frames.len() + self.pending_audio.len()
    }
}

fn push_bounded(queue: &mut VecDeque<OutboundMediaChunk>, chunk: OutboundMediaChunk, cap: usize) {
    if queue.len() >= cap {
        queue.pop_front();
    }
    queue.push_back(chunk);
}
