//! TTS (Text-to-Speech) Module
//!
//! Provides the synthesis provider contract and the response stage built on it:
//! - Piper: local neural TTS binary
//! - Cloud: OpenAI-compatible speech endpoint (network)
//!
//! Synthesized audio is cached per phrase so repeated confirmations never
//! hit a provider twice.

pub mod cache;
pub mod cloud;
pub mod piper;
pub mod stage;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::ProviderError;

// Re-export main types
pub use cache::{CachedPhrase, PhraseCache};
pub use cloud::CloudTts;
pub use piper::PiperTts;
pub use stage::ResponseStage;

/// Encoded audio ready for playback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPayload {
    pub bytes: Arc<[u8]>,
    pub mime: String,
}

impl AudioPayload {
    pub fn wav(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
            mime: "audio/wav".to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Trait for TTS providers
#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Unique provider name, used as the registry key
    fn name(&self) -> &str;

    /// Synthesize `text` with the configured voice
    async fn synthesize(&self, text: &str, voice: &str) -> Result<AudioPayload, ProviderError>;

    /// Cheap reachability probe
    async fn health_check(&self) -> bool {
        true
    }
}
