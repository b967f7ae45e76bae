//! FieldVoice Library
//!
//! Voice command pipeline for hands-busy field work: capture, recognition,
//! intent resolution, dispatch and spoken confirmation, degrading from cloud
//! providers to local ones to text-only as connectivity and health allow.

pub mod asr;
pub mod audio;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod mode;
pub mod pipeline;
pub mod providers;
pub mod recovery;
pub mod telemetry;
pub mod tts;
pub mod utils;
pub mod utterance;

pub use config::Config;
pub use error::{FailureReason, VoiceError, VoiceResult};
pub use pipeline::{PipelineParts, VoicePipeline};
