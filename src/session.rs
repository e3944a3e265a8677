//! Host-facing live session
//!
//! Wires the capture adapters, pacer, transport, demultiplexer, playback
//! controller, half-duplex coordinator and tool orchestrator into one
//! event loop. The loop processes inbound messages one at a time; the only
//! concurrent work it spawns is the tool orchestrator's background
//! finalization, which is deliberately unordered relative to later events.

use crate::config::SessionConfig;
use crate::demux::EventDemux;
use crate::error::Result;
use crate::events::{
    ActivityStatus, InboundEvent, MediaEvent, OutboundMediaChunk, TranscriptSource,
    TranscriptUpdate,
};
use crate::halfduplex::HalfDuplex;
use crate::media_in::{self, AudioSource, FrameSource};
use crate::pacer::MediaPacer;
use crate::pipeline::ListingPipeline;
use crate::playback::{AudioSink, PlaybackController};
use crate::tools::{tool_declarations, FinalizeCallback, ToolOrchestrator};
use crate::transport::{RawInbound, SessionState, StatusCallback, Transport};
use crate::wire::{ClientMessage, LiveSetup, RealtimeInput};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Housekeeping cadence for levels, playback and the half-duplex failsafe.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

pub type LevelCallback = Arc<dyn Fn(f32, f32, ActivityStatus) + Send + Sync>;
pub type TextCallback = Arc<dyn Fn(String) + Send + Sync>;
pub type TranscriptCallback = Arc<dyn Fn(TranscriptUpdate) + Send + Sync>;

/// Host callbacks. Every failure the host should see arrives through one
/// of these; nothing in the session surfaces raw protocol errors.
#[derive(Clone)]
pub struct SessionCallbacks {
    pub status: StatusCallback,
    pub levels: LevelCallback,
    pub text: TextCallback,
    pub transcript: TranscriptCallback,
    pub finalize: FinalizeCallback,
}

impl SessionCallbacks {
    /// Callbacks that ignore everything, for headless use and tests.
    pub fn noop() -> Self {
        Self {
            status: Arc::new(|_| {}),
            levels: Arc::new(|_, _, _| {}),
            text: Arc::new(|_| {}),
            transcript: Arc::new(|_| {}),
            finalize: Arc::new(|_| {}),
        }
    }
}

/// One end-to-end connected lifetime between this device and the peer.
pub struct LiveSession {
    transport: Transport,
    media_tx: UnboundedSender<MediaEvent>,
    config: SessionConfig,
    loop_handle: Option<JoinHandle<()>>,
}

impl LiveSession {
    /// Connect and start processing. Returns once the socket is open; setup
    /// acknowledgment arrives asynchronously and unblocks outbound media.
    pub async fn start(
        config: SessionConfig,
        pipeline: Arc<dyn ListingPipeline>,
        sink: Box<dyn AudioSink>,
        callbacks: SessionCallbacks,
    ) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();

        let setup = LiveSetup::for_session(
            &config.model,
            config.system_instruction.as_deref(),
            Some(tool_declarations()),
        );
        let transport = Transport::new(
            config.url.clone(),
            setup,
            raw_tx,
            Arc::clone(&callbacks.status),
        );

        let core = SessionCore::new(&config, transport.clone(), pipeline, sink, callbacks);
        transport.connect().await?;

        let loop_handle = tokio::spawn(core.run(raw_rx, media_rx));
        info!("live session started");

        Ok(Self {
            transport,
            media_tx,
            config,
            loop_handle: Some(loop_handle),
        })
    }

    /// Channel capture adapters push media into.
    pub fn media_sender(&self) -> UnboundedSender<MediaEvent> {
        self.media_tx.clone()
    }

    /// Spawn a camera adapter sampling at the configured frame interval.
    pub fn attach_camera(&self, source: impl FrameSource) {
        media_in::spawn_camera_capture(source, self.media_tx.clone(), self.config.frame_interval);
    }

    /// Spawn a microphone adapter on its own capture thread.
    pub fn attach_microphone(&self, source: impl AudioSource) {
        media_in::spawn_mic_capture(source, self.media_tx.clone());
    }

    pub fn state(&self) -> SessionState {
        self.transport.state()
    }

    /// Tear the session down. Idempotent; waits for the event loop to
    /// finish its synchronous cleanup.
    pub async fn stop(&mut self) {
        self.transport.close();
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.await;
        }
        info!("live session stopped");
    }
}

/// The single owner of all per-session mutable state.
struct SessionCore {
    transport: Transport,
    demux: EventDemux,
    pacer: MediaPacer,
    playback: PlaybackController,
    halfduplex: HalfDuplex,
    tools: ToolOrchestrator,
    tool_rx: UnboundedReceiver<ClientMessage>,
    callbacks: SessionCallbacks,
    input_level: f32,
}

impl SessionCore {
    fn new(
        config: &SessionConfig,
        transport: Transport,
        pipeline: Arc<dyn ListingPipeline>,
        sink: Box<dyn AudioSink>,
        callbacks: SessionCallbacks,
    ) -> Self {
        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            demux: EventDemux::new(config.audio_dedup_window, config.turn_complete_cooldown),
            pacer: MediaPacer::new(
                config.frame_interval,
                config.audio_interval,
                config.pre_setup_buffer,
            ),
            playback: PlaybackController::new(
                sink,
                config.playback_prebuffer,
                config.playback_max_queued,
            ),
            halfduplex: HalfDuplex::new(config.speaking_failsafe),
            tools: ToolOrchestrator::new(tool_tx, pipeline, Arc::clone(&callbacks.finalize)),
            tool_rx,
            callbacks,
            input_level: 0.0,
        }
    }

    async fn run(
        mut self,
        mut raw_rx: UnboundedReceiver<RawInbound>,
        mut media_rx: UnboundedReceiver<MediaEvent>,
    ) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        let mut media_open = true;

        loop {
            tokio::select! {
                maybe_raw = raw_rx.recv() => {
                    match maybe_raw {
                        Some(RawInbound::Text(text)) => self.on_raw(&text),
                        Some(RawInbound::Closed) | None => {
                            self.teardown();
                            break;
                        }
                    }
                }
                maybe_media = media_rx.recv(), if media_open => {
                    match maybe_media {
                        Some(event) => self.on_media(event),
                        None => media_open = false,
                    }
                }
                maybe_tool = self.tool_rx.recv() => {
                    // The orchestrator holds the sender, so this stays open
                    // for the lifetime of the loop.
                    if let Some(msg) = maybe_tool {
                        if let Err(e) = self.transport.send(&msg) {
                            warn!("failed to send tool response: {}", e);
                        }
                    }
                }
                _ = ticker.tick() => self.on_tick(),
            }
        }
        debug!("session event loop finished");
    }

    fn on_raw(&mut self, text: &str) {
        let now = Instant::now();
        for event in self.demux.ingest(text, now) {
            self.dispatch(event, now);
        }
    }

    fn dispatch(&mut self, event: InboundEvent, now: Instant) {
        match event {
            InboundEvent::SetupComplete => {
                self.transport.mark_ready();
                for chunk in self.pacer.flush(now) {
                    self.send_chunk(chunk);
                }
            }
            InboundEvent::Audio { data, sample_rate, .. } => {
                self.halfduplex.on_model_audio();
                self.playback.enqueue(data, sample_rate, now);
            }
            InboundEvent::Text { content } => {
                (self.callbacks.text)(content);
            }
            InboundEvent::ToolCall(requests) => {
                for request in requests {
                    self.tools.handle(request);
                }
            }
            InboundEvent::TurnComplete => {
                self.halfduplex.on_turn_complete();
            }
            InboundEvent::Interrupted => {
                if self.halfduplex.on_interrupted() {
                    self.playback.interrupt();
                }
            }
            InboundEvent::InputTranscription { text, finished } => {
                (self.callbacks.transcript)(TranscriptUpdate {
                    source: TranscriptSource::User,
                    text,
                    finished,
                });
            }
            InboundEvent::OutputTranscription { text, finished } => {
                (self.callbacks.transcript)(TranscriptUpdate {
                    source: TranscriptSource::Model,
                    text,
                    finished,
                });
            }
            InboundEvent::ServerError(detail) => {
                warn!("peer reported error: {}", detail);
            }
        }
    }

    fn on_media(&mut self, event: MediaEvent) {
        let now = Instant::now();
        let ready = self.transport.is_ready();
        match event {
            MediaEvent::Audio { pcm, sample_rate, level } => {
                self.input_level = level;
                if self.halfduplex.model_is_speaking() {
                    // Capture keeps running for metering; output is dropped
                    // so the session never hears its own playback.
                    return;
                }
                for chunk in self.pacer.submit_audio(pcm, sample_rate, ready, now) {
                    self.send_chunk(chunk);
                }
            }
            MediaEvent::Frame { jpeg, mime_type } => {
                if let Some(chunk) = self.pacer.submit_frame(jpeg, &mime_type, ready, now) {
                    self.send_chunk(chunk);
                }
            }
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        self.playback.tick(now);
        self.halfduplex.poll_failsafe(self.playback.is_idle(now), now);

        let status = if self.halfduplex.model_is_speaking() {
            ActivityStatus::Speaking
        } else if self.transport.is_ready() {
            ActivityStatus::Listening
        } else {
            ActivityStatus::Idle
        };
        (self.callbacks.levels)(self.input_level, self.playback.output_level(), status);
    }

    fn send_chunk(&mut self, chunk: OutboundMediaChunk) {
        let (msg, frame) = match chunk {
            OutboundMediaChunk::Frame { jpeg, mime_type, .. } => {
                let input = RealtimeInput::video_frame(&jpeg, &mime_type);
                (ClientMessage::RealtimeInput { realtime_input: input }, Some(jpeg))
            }
            OutboundMediaChunk::Audio { pcm, sample_rate, .. } => {
                let input = RealtimeInput::audio_chunk(&pcm, sample_rate);
                (ClientMessage::RealtimeInput { realtime_input: input }, None)
            }
        };

        match self.transport.send(&msg) {
            Ok(()) => {
                if let Some(jpeg) = frame {
                    self.tools.note_frame(jpeg);
                }
            }
            Err(e) => debug!("dropping outbound chunk: {}", e),
        }
    }

    /// Synchronous release of all session-scoped state. Background
    /// finalizations keep running; their results are discarded.
    fn teardown(&mut self) {
        self.demux.reset();
        self.pacer.clear();
        self.playback.interrupt();
        self.halfduplex.reset();
        self.tools.close();
        self.input_level = 0.0;
        info!("session state released");
    }
}
