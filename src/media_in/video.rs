//! Camera capture adapter
//!
//! Polls a frame source on its own timer and pushes encoded frames into the
//! session's media channel. Encoding happens at the source; this adapter
//! never touches pixels and never blocks on the network.

use crate::events::MediaEvent;
use anyhow::Result;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::interval;
use tracing::{debug, error, info};

/// An already-encoded camera frame.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub jpeg: Vec<u8>,
    pub mime_type: String,
}

/// Source of encoded camera frames. Implementations wrap the platform
/// camera and may block on device I/O; `None` means nothing new to send.
pub trait FrameSource: Send + 'static {
    fn capture(&mut self) -> Result<Option<EncodedFrame>>;
}

pub fn spawn_camera_capture(
    mut source: impl FrameSource,
    tx: UnboundedSender<MediaEvent>,
    sample_interval: Duration,
) {
    info!("starting camera capture every {}ms", sample_interval.as_millis());

    tokio::spawn(async move {
        let mut ticker = interval(sample_interval);
        loop {
            ticker.tick().await;

            match source.capture() {
                Ok(Some(frame)) => {
                    let event = MediaEvent::Frame {
                        jpeg: frame.jpeg,
                        mime_type: frame.mime_type,
                    };
                    if tx.send(event).is_err() {
                        debug!("media channel closed, stopping camera capture");
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("frame capture error: {}", e);
                }
            }
        }
    });
}
