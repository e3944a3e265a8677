//! Playback backpressure controller
//!
//! Queues synthesized peer audio ahead of an injected output sink. A small
//! pre-buffer is accumulated before playback starts, trading a fixed bit of
//! latency for gap-free output under jitter; a hard cap on queued duration
//! clears the whole queue at once rather than trimming, since partial trims
//! produce audible fragmentation.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Smoothing factor for the reported output level.
const LEVEL_ALPHA: f32 = 0.3;

/// Where decoded PCM ultimately goes. Implementations wrap the platform
/// audio engine; `stop` halts output but must leave the engine reusable.
pub trait AudioSink: Send {
    fn write(&mut self, pcm: &[u8], sample_rate: u32);
    fn stop(&mut self);
}

/// Sink that discards everything. Useful for headless runs and tests.
pub struct NullSink;

impl AudioSink for NullSink {
    fn write(&mut self, _pcm: &[u8], _sample_rate: u32) {}
    fn stop(&mut self) {}
}

pub struct PlaybackController {
    sink: Box<dyn AudioSink>,
    prebuffer: Duration,
    max_queued: Duration,

    /// Chunks held back until the pre-buffer threshold is met.
    queue: VecDeque<(Vec<u8>, u32)>,
    queued_duration: Duration,
    started: bool,
    /// When audio already handed to the sink will run out.
    play_head: Option<Instant>,
    level: f32,
}

impl PlaybackController {
    pub fn new(sink: Box<dyn AudioSink>, prebuffer: Duration, max_queued: Duration) -> Self {
        Self {
            sink,
            prebuffer,
            max_queued,
            queue: VecDeque::new(),
            queued_duration: Duration::ZERO,
            started: false,
            play_head: None,
            level: 0.0,
        }
    }

    /// Accept a decoded PCM chunk (S16LE mono).
    pub fn enqueue(&mut self, pcm: Vec<u8>, sample_rate: u32, now: Instant) {
        if pcm.is_empty() {
            return;
        }

        let duration = pcm_duration(pcm.len(), sample_rate);
        self.level = LEVEL_ALPHA * rms_level(&pcm) + (1.0 - LEVEL_ALPHA) * self.level;

        if self.pending(now) + duration > self.max_queued {
            warn!(
                queued_ms = self.pending(now).as_millis() as u64,
                "playback queue overflow, clearing everything"
            );
            self.sink.stop();
            self.queue.clear();
            self.queued_duration = Duration::ZERO;
            self.started = false;
            self.play_head = None;
            // Everything goes, this chunk included; accumulation restarts
            // fresh on the next one.
            return;
        }

        if self.started {
            self.sink.write(&pcm, sample_rate);
            let head = self.play_head.filter(|h| *h > now).unwrap_or(now);
            self.play_head = Some(head + duration);
            return;
        }

        self.queue.push_back((pcm, sample_rate));
        self.queued_duration += duration;

        if self.queued_duration >= self.prebuffer {
            debug!(
                buffered_ms = self.queued_duration.as_millis() as u64,
                "pre-buffer reached, starting playback"
            );
            self.start(now);
        }
    }

    fn start(&mut self, now: Instant) {
        self.started = true;
        let mut head = now;
        for (pcm, rate) in self.queue.drain(..) {
            head += pcm_duration(pcm.len(), rate);
            self.sink.write(&pcm, rate);
        }
        self.queued_duration = Duration::ZERO;
        self.play_head = Some(head);
    }

    /// Hard stop: halt the sink and drop everything queued.
    pub fn interrupt(&mut self) {
        self.sink.stop();
        self.queue.clear();
        self.queued_duration = Duration::ZERO;
        self.started = false;
        self.play_head = None;
        self.level = 0.0;
    }

    /// Drop queued audio without touching the output engine.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.queued_duration = Duration::ZERO;
    }

    /// Periodic housekeeping; decays the level once output runs dry.
    pub fn tick(&mut self, now: Instant) {
        if self.is_idle(now) {
            self.level = 0.0;
            if self.started {
                self.started = false;
                self.play_head = None;
            }
        }
    }

    /// True when nothing is queued and nothing is scheduled on the sink.
    pub fn is_idle(&self, now: Instant) -> bool {
        let scheduled = self.play_head.map(|h| h > now).unwrap_or(false);
        self.queue.is_empty() && !scheduled
    }

    /// Smoothed output loudness in [0, 1].
    pub fn output_level(&self) -> f32 {
        self.level
    }

    /// Audio not yet played out, queued plus scheduled.
    fn pending(&self, now: Instant) -> Duration {
        let scheduled = self
            .play_head
            .map(|h| h.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        self.queued_duration + scheduled
    }
}

fn pcm_duration(byte_len: usize, sample_rate: u32) -> Duration {
    let samples = (byte_len / 2) as f64;
    Duration::from_secs_f64(samples / sample_rate.max(1) as f64)
}

fn rms_level(pcm: &[u8]) -> f32 {
    if pcm.len() < 2 {
        return 0.0;
    }
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for chunk in pcm.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f64;
        sum += sample * sample;
        count += 1;
    }
    ((sum / count as f64).sqrt() / i16::MAX as f64) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingSink {
        writes: Arc<Mutex<Vec<usize>>>,
        stops: Arc<Mutex<usize>>,
    }

    impl AudioSink for RecordingSink {
        fn write(&mut self, pcm: &[u8], _sample_rate: u32) {
            self.writes.lock().unwrap().push(pcm.len());
        }
        fn stop(&mut self) {
            *self.stops.lock().unwrap() += 1;
        }
    }

    fn controller(sink: RecordingSink) -> PlaybackController {
        PlaybackController::new(
            Box::new(sink),
            Duration::from_millis(200),
            Duration::from_millis(3500),
        )
    }

    /// 100 ms of 16 kHz S16LE mono.
    fn chunk_100ms() -> Vec<u8> {
        vec![0x10; 3200]
    }

    #[test]
    fn playback_waits_for_prebuffer_then_starts_once() {
        let sink = RecordingSink::default();
        let mut c = controller(sink.clone());
        let t0 = Instant::now();

        c.enqueue(chunk_100ms(), 16000, t0);
        assert!(sink.writes.lock().unwrap().is_empty());

        // Crossing 200 ms starts playback and drains the queue in order.
        c.enqueue(chunk_100ms(), 16000, t0 + Duration::from_millis(10));
        assert_eq!(sink.writes.lock().unwrap().len(), 2);

        // Subsequent chunks stream straight through.
        c.enqueue(chunk_100ms(), 16000, t0 + Duration::from_millis(20));
        assert_eq!(sink.writes.lock().unwrap().len(), 3);
    }

    #[test]
    fn overflow_clears_the_entire_queue() {
        let sink = RecordingSink::default();
        let mut c = PlaybackController::new(
            Box::new(sink.clone()),
            Duration::from_millis(200),
            Duration::from_millis(300),
        );
        let t0 = Instant::now();

        c.enqueue(chunk_100ms(), 16000, t0);
        c.enqueue(chunk_100ms(), 16000, t0);
        c.enqueue(chunk_100ms(), 16000, t0);
        // A fourth chunk would exceed the 300 ms cap: everything goes.
        c.enqueue(chunk_100ms(), 16000, t0);

        assert_eq!(*sink.stops.lock().unwrap(), 1);
        assert!(c.is_idle(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn interrupt_stops_and_silences() {
        let sink = RecordingSink::default();
        let mut c = controller(sink.clone());
        let t0 = Instant::now();

        c.enqueue(chunk_100ms(), 16000, t0);
        c.enqueue(chunk_100ms(), 16000, t0);
        c.enqueue(chunk_100ms(), 16000, t0);
        assert!(!c.is_idle(t0));

        c.interrupt();
        assert_eq!(*sink.stops.lock().unwrap(), 1);
        assert!(c.is_idle(t0));
        assert_eq!(c.output_level(), 0.0);
    }

    #[test]
    fn level_reaches_zero_one_tick_after_empty() {
        let sink = RecordingSink::default();
        let mut c = controller(sink.clone());
        let t0 = Instant::now();

        c.enqueue(chunk_100ms(), 16000, t0);
        assert!(c.output_level() > 0.0);

        // Still pre-buffering: the queue holds 100 ms, so after it would
        // have played out the controller is idle and one tick zeroes it.
        c.interrupt();
        c.tick(t0 + Duration::from_millis(1));
        assert_eq!(c.output_level(), 0.0);
    }

    #[test]
    fn level_decays_after_scheduled_audio_runs_out() {
        let sink = RecordingSink::default();
        let mut c = controller(sink.clone());
        let t0 = Instant::now();

        c.enqueue(chunk_100ms(), 16000, t0);
        c.enqueue(chunk_100ms(), 16000, t0);
        c.enqueue(chunk_100ms(), 16000, t0);
        assert!(c.output_level() > 0.0);

        // 300 ms of audio were scheduled; just past that the queue is dry.
        c.tick(t0 + Duration::from_millis(310));
        assert_eq!(c.output_level(), 0.0);
        assert!(c.is_idle(t0 + Duration::from_millis(310)));
    }

    #[test]
    fn clear_keeps_the_engine_running() {
        let sink = RecordingSink::default();
        let mut c = controller(sink.clone());
        let t0 = Instant::now();

        c.enqueue(chunk_100ms(), 16000, t0);
        c.clear();
        assert_eq!(*sink.stops.lock().unwrap(), 0);
        assert!(c.is_idle(t0));
    }

    #[test]
    fn silence_has_zero_level() {
        assert_eq!(rms_level(&[0u8; 640]), 0.0);
        assert!(rms_level(&chunk_100ms()) > 0.0);
    }
}
