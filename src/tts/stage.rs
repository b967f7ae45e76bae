//! Response Synthesis Stage
//!
//! Speaks response text: phrase cache first, then a TTS provider through the
//! recovery engine, then playback. With nothing able to synthesize, the
//! response degrades to text only.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AudioPayload, PhraseCache};
use crate::audio::AudioOutput;
use crate::config::ResponseConfig;
use crate::error::FailureReason;
use crate::mode::DegradationLevel;
use crate::providers::{ProviderCatalog, Role};
use crate::recovery::RecoveryEngine;
use crate::utterance::SpokenResponse;

pub struct ResponseStage {
    recovery: Arc<RecoveryEngine>,
    catalog: Arc<ProviderCatalog>,
    cache: PhraseCache,
    output: Arc<dyn AudioOutput>,
    voice: String,
    pinned: Vec<String>,
}

impl ResponseStage {
    pub fn new(
        recovery: Arc<RecoveryEngine>,
        catalog: Arc<ProviderCatalog>,
        output: Arc<dyn AudioOutput>,
        config: &ResponseConfig,
    ) -> Self {
        Self {
            recovery,
            catalog,
            cache: PhraseCache::new(config.cache_capacity),
            output,
            voice: config.voice.clone(),
            pinned: config.pinned_phrases.clone(),
        }
    }

    pub fn cache(&self) -> &PhraseCache {
        &self.cache
    }

    /// Synthesize and pin the configured phrases. Returns how many were added.
    pub async fn prewarm(&self, level: DegradationLevel, cancel: &CancellationToken) -> usize {
        let mut added = 0;
        for phrase in &self.pinned {
            if self.cache.is_pinned(phrase) {
                continue;
            }
            if let Some(cached) = self.cache.get(phrase) {
                self.cache.pin(phrase, cached.audio);
                added += 1;
                continue;
            }
            match self.synthesize(phrase, level, cancel).await {
                Ok(Some(audio)) => {
                    self.cache.pin(phrase, audio);
                    added += 1;
                }
                Ok(None) => {
                    debug!("No TTS provider at level {}, skipping prewarm", level);
                    break;
                }
                Err(FailureReason::UserCancelled) => break,
                Err(reason) => warn!("⚠️ Could not prewarm '{}': {}", phrase, reason),
            }
        }
        if added > 0 {
            info!("🔥 Prewarmed {} phrase(s)", added);
        }
        added
    }

    /// Speak `text` under `level`
    pub async fn speak(
        &self,
        text: &str,
        level: DegradationLevel,
        cancel: &CancellationToken,
    ) -> SpokenResponse {
        let text = text.trim();
        if text.is_empty() || cancel.is_cancelled() {
            return SpokenResponse::Silent;
        }
        if level == DegradationLevel::Disabled {
            return text_only(text);
        }

        if let Some(cached) = self.cache.get(text) {
            debug!("💾 Cache hit for '{}'", text);
            return self.play(text, &cached.audio, true, cancel).await;
        }

        match self.synthesize(text, level, cancel).await {
            Ok(Some(audio)) => {
                self.cache.insert(text, audio.clone());
                self.play(text, &audio, false, cancel).await
            }
            Ok(None) => text_only(text),
            Err(FailureReason::UserCancelled) => SpokenResponse::Silent,
            Err(reason) => {
                warn!("⚠️ Synthesis failed ({}), showing text", reason);
                text_only(text)
            }
        }
    }

    /// `Ok(None)` when no TTS provider is allowed and viable at this level
    async fn synthesize(
        &self,
        text: &str,
        level: DegradationLevel,
        cancel: &CancellationToken,
    ) -> Result<Option<AudioPayload>, FailureReason> {
        let allowed = level.allowed_tiers(Role::Tts);
        if self.catalog.tts.is_empty() || self.recovery.registry().select(Role::Tts, allowed).is_err() {
            return Ok(None);
        }

        let voice = self.voice.as_str();
        let attempted = self
            .recovery
            .execute(Role::Tts, allowed, &self.catalog.tts, cancel, |provider| async move {
                provider.synthesize(text, voice).await
            })
            .await?;
        debug!("🗣️ '{}' synthesized by {}", text, attempted.provider);
        Ok(Some(attempted.value))
    }

    async fn play(
        &self,
        text: &str,
        audio: &AudioPayload,
        cached: bool,
        cancel: &CancellationToken,
    ) -> SpokenResponse {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.output.stop();
                info!("🛑 Playback interrupted");
                return SpokenResponse::Silent;
            }
            result = self.output.play(audio) => result,
        };

        match result {
            Ok(()) => {
                info!("🔊 Spoke '{}'{}", text, if cached { " (cached)" } else { "" });
                SpokenResponse::Spoken {
                    text: text.to_string(),
                    cached,
                }
            }
            Err(e) => {
                warn!("⚠️ Playback failed ({}), showing text", e);
                text_only(text)
            }
        }
    }
}

fn text_only(text: &str) -> SpokenResponse {
    info!("💬 {}", text);
    SpokenResponse::TextOnly {
        text: text.to_string(),
    }
}
