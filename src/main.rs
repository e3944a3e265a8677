//! merchlive demo binary
//!
//! Starts a live listing session with stub capture sources, so the wiring
//! can be exercised end to end against a real peer without camera or
//! microphone hardware.

use anyhow::{Context, Result};
use async_trait::async_trait;
use merchlive::media_in::{AudioSource, EncodedFrame, FrameSource};
use merchlive::{
    ListingOutcome, ListingPipeline, ListingRequest, LiveSession, NullSink, SessionCallbacks,
    SessionConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Frame source that cycles a single placeholder JPEG.
struct StubCamera {
    jpeg: Vec<u8>,
}

impl FrameSource for StubCamera {
    fn capture(&mut self) -> Result<Option<EncodedFrame>> {
        Ok(Some(EncodedFrame {
            jpeg: self.jpeg.clone(),
            mime_type: "image/jpeg".to_string(),
        }))
    }
}

/// Audio source producing 20 ms chunks of silence at 16 kHz.
struct StubMicrophone;

impl AudioSource for StubMicrophone {
    fn sample_rate(&self) -> u32 {
        16000
    }

    fn read_chunk(&mut self) -> Result<Vec<i16>> {
        std::thread::sleep(Duration::from_millis(20));
        Ok(vec![0i16; 320])
    }
}

/// Pipeline stub that reports success without persisting anything.
struct LoggingPipeline;

#[async_trait]
impl ListingPipeline for LoggingPipeline {
    async fn create_listing(&self, request: ListingRequest) -> ListingOutcome {
        info!(
            title = %request.title,
            images = request.reference_images.len(),
            "pipeline invoked"
        );
        ListingOutcome::ok("demo-listing", "https://example.invalid/artwork.png")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "merchlive=info".into()),
        )
        .init();
    info!("starting merchlive demo session");

    let api_key = std::env::var("MERCHLIVE_API_KEY")
        .or_else(|_| std::env::var("GEMINI_API_KEY"))
        .context("set MERCHLIVE_API_KEY or GEMINI_API_KEY")?;

    let mut config = SessionConfig::from_api_key(&api_key);
    config.system_instruction = Some(
        "You help the user list items for sale. When the camera shows an item, \
         capture reference photos and finalize a listing once the user confirms."
            .to_string(),
    );

    let mut callbacks = SessionCallbacks::noop();
    callbacks.status = Arc::new(|state| info!("session state: {:?}", state));
    callbacks.text = Arc::new(|text| info!("model: {}", text));
    callbacks.transcript = Arc::new(|update| {
        info!("transcript ({:?}, final={}): {}", update.source, update.finished, update.text)
    });
    callbacks.finalize = Arc::new(|result| {
        info!(
            "finalize {}: success={} listing={:?} error={:?}",
            result.item_ref, result.success, result.listing_id, result.error
        )
    });

    let mut session = LiveSession::start(
        config,
        Arc::new(LoggingPipeline),
        Box::new(NullSink),
        callbacks,
    )
    .await?;

    session.attach_camera(StubCamera {
        jpeg: vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10],
    });
    session.attach_microphone(StubMicrophone);

    info!("session running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    session.stop().await;
    info!("merchlive demo stopped");
    Ok(())
}
