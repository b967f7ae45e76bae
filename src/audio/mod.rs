//! Audio module
//!
//! Microphone capture, the conditioning chain, utterance segmentation, the
//! live audio handed to recognition and playback of synthesized responses.

pub mod capture;
pub mod conditioning;
pub mod engine;
pub mod live;
pub mod segmenter;

use async_trait::async_trait;

use crate::error::VoiceResult;
use crate::tts::AudioPayload;

pub use capture::{start_capture, CaptureHandle, CaptureStream};
pub use conditioning::{ConditioningChain, FrameInfo};
pub use engine::SoundEngine;
pub use live::{AudioStream, LiveAudio, LiveAudioWriter};
pub use segmenter::{detect_segment_boundaries, Segmenter};

/// Where spoken responses are played
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play `audio` and return once it finished or was stopped
    async fn play(&self, audio: &AudioPayload) -> VoiceResult<()>;

    /// Interrupt whatever is playing
    fn stop(&self);
}

/// Root-mean-square energy of a frame
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}
