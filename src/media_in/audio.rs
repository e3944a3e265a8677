//! Microphone capture adapter
//!
//! Runs the blocking device reads on a dedicated thread and pushes PCM
//! chunks with a normalized loudness level into the session's media
//! channel. The level is computed here so metering keeps working even when
//! the session is discarding mic output during peer speech.

use crate::events::MediaEvent;
use anyhow::Result;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info};

/// Source of raw microphone PCM (S16LE mono). Implementations wrap the
/// platform audio stack; `read_chunk` is expected to block on hardware.
pub trait AudioSource: Send + 'static {
    fn sample_rate(&self) -> u32;
    fn read_chunk(&mut self) -> Result<Vec<i16>>;
}

pub fn spawn_mic_capture(mut source: impl AudioSource, tx: UnboundedSender<MediaEvent>) {
    let sample_rate = source.sample_rate();
    info!("starting microphone capture at {}Hz", sample_rate);

    std::thread::spawn(move || loop {
        let samples = match source.read_chunk() {
            Ok(s) => s,
            Err(e) => {
                error!("microphone read error: {}", e);
                break;
            }
        };
        if samples.is_empty() {
            continue;
        }

        let level = normalized_level(&samples);
        let event = MediaEvent::Audio {
            pcm: i16_slice_to_u8(&samples),
            sample_rate,
            level,
        };
        if tx.send(event).is_err() {
            debug!("media channel closed, stopping microphone capture");
            break;
        }
    });
}

/// RMS loudness normalized into [0, 1].
pub fn normalized_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    ((sum / samples.len() as f64).sqrt() / i16::MAX as f64) as f32
}

pub fn i16_slice_to_u8(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_is_zero_level() {
        assert_eq!(normalized_level(&[0i16; 320]), 0.0);
    }

    #[test]
    fn full_scale_is_near_one() {
        let level = normalized_level(&[i16::MAX; 320]);
        assert!((level - 1.0).abs() < 0.001);
    }

    #[test]
    fn pcm_byte_conversion_is_little_endian() {
        let bytes = i16_slice_to_u8(&[0x0102, -1]);
        assert_eq!(bytes, vec![0x02, 0x01, 0xFF, 0xFF]);
    }
}
