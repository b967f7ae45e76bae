//! ASR (Automatic Speech Recognition) Module
//!
//! Provides the STT provider contract and the recognition stage that drives it:
//! - Wyoming: local recognition server (e.g. faster-whisper), JSON lines over TCP
//! - Whisper: OpenAI-compatible HTTP transcription (network)

pub mod stage;
pub mod whisper;
pub mod wyoming;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::audio::AudioStream;
use crate::error::{FailureReason, ProviderError};
use crate::utterance::FinalTranscript;

// Re-export main types
pub use stage::RecognitionStage;
pub use whisper::WhisperStt;
pub use wyoming::WyomingStt;

/// Hands partial results back to the recognition stage while a provider works
#[derive(Debug, Clone)]
pub struct InterimSink {
    tx: mpsc::UnboundedSender<(String, f32)>,
}

impl InterimSink {
    pub fn new(tx: mpsc::UnboundedSender<(String, f32)>) -> Self {
        Self { tx }
    }

    /// A sink nobody listens to
    pub fn discard() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn emit(&self, text: impl Into<String>, confidence: f32) {
        // Receiver gone means the turn already ended; partials are UI-only
        let _ = self.tx.send((text.into(), confidence));
    }
}

/// Trait for speech-to-text providers
#[async_trait]
pub trait SttProvider: Send + Sync {
    /// Unique provider name, used as the registry key
    fn name(&self) -> &str;

    /// Transcribe an utterance while it is being spoken. `audio` yields
    /// frames until the segment closes; partial results go to `interim`.
    /// Providers that need the whole utterance call [`AudioStream::collect`].
    async fn transcribe(
        &self,
        audio: AudioStream,
        language: &str,
        interim: &InterimSink,
    ) -> Result<FinalTranscript, ProviderError>;

    /// Cheap reachability probe
    async fn health_check(&self) -> bool {
        true
    }
}

/// Recognition state of one utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum RecognitionState {
    Idle,
    Listening,
    Transcribing,
    Finalized,
    Failed(FailureReason),
}

impl RecognitionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecognitionState::Finalized | RecognitionState::Failed(_))
    }
}

/// Events published by the recognition stage
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    State {
        utterance_id: u64,
        state: RecognitionState,
    },
    /// Non-authoritative partial text, for live feedback only
    Interim {
        utterance_id: u64,
        text: String,
        confidence: f32,
        at: Instant,
    },
    Finalized {
        utterance_id: u64,
        transcript: FinalTranscript,
        provider: String,
    },
    Failed {
        utterance_id: u64,
        reason: FailureReason,
    },
}

impl RecognitionEvent {
    pub fn utterance_id(&self) -> u64 {
        match self {
            RecognitionEvent::State { utterance_id, .. }
            | RecognitionEvent::Interim { utterance_id, .. }
            | RecognitionEvent::Finalized { utterance_id, .. }
            | RecognitionEvent::Failed { utterance_id, .. } => *utterance_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecognitionEvent::Finalized { .. } | RecognitionEvent::Failed { .. }
        )
    }
}
