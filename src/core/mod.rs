//! Core intent modules
//!
//! Contains the reasoning provider contract, the offline pattern matcher,
//! transcript normalization and the intent resolution stage.

pub mod intent;
pub mod ollama;
pub mod patterns;
pub mod resolver;
pub mod text_normalizer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dispatch::ContextSnapshot;
use crate::error::ProviderError;

pub use intent::{Action, Intent, IntentSource};
pub use ollama::OllamaReasoner;
pub use patterns::PatternMatcher;
pub use resolver::IntentStage;
pub use text_normalizer::TextNormalizer;

/// What a reasoning provider is asked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningRequest {
    pub transcript: String,
    pub context: ContextSnapshot,
    pub language: String,
}

/// Trait for cloud (or local) reasoning providers
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Map a transcript to an intent. Anything that does not fit the schema
    /// must come back as [`ProviderError::Malformed`].
    async fn reason(&self, request: &ReasoningRequest) -> Result<Intent, ProviderError>;

    async fn health_check(&self) -> bool {
        true
    }
}
