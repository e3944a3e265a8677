//! Media capture adapters: push sources with no protocol knowledge

pub mod audio;
pub mod video;

pub use audio::{spawn_mic_capture, AudioSource};
pub use video::{spawn_camera_capture, EncodedFrame, FrameSource};
