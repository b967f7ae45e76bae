//! Intent Resolution Stage
//!
//! Routes a final transcript to a reasoning provider when the level allows
//! one, and to the offline pattern matcher otherwise (or when reasoning fails).
//! Never mutates application state.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Action, Intent, IntentSource, PatternMatcher, ReasoningRequest, TextNormalizer};
use crate::config::{IntentConfig, RecognitionConfig};
use crate::dispatch::ContextSnapshot;
use crate::error::{FailureReason, ProviderError, VoiceResult};
use crate::mode::DegradationLevel;
use crate::providers::{ProviderCatalog, Role};
use crate::recovery::RecoveryEngine;
use crate::utils::find_best_match;

/// Minimum similarity for snapping a spoken view name onto a known view
const VIEW_MATCH_CUTOFF: f64 = 0.6;

pub struct IntentStage {
    recovery: Arc<RecoveryEngine>,
    catalog: Arc<ProviderCatalog>,
    patterns: PatternMatcher,
    known_views: Vec<String>,
    language: String,
}

impl IntentStage {
    pub fn new(
        recovery: Arc<RecoveryEngine>,
        catalog: Arc<ProviderCatalog>,
        intent: &IntentConfig,
        recognition: &RecognitionConfig,
    ) -> VoiceResult<Self> {
        let normalizer = TextNormalizer::new(&intent.corrections);
        Ok(Self {
            recovery,
            catalog,
            patterns: PatternMatcher::new(intent.pattern_confidence, normalizer)?,
            known_views: intent.known_views.clone(),
            language: recognition.language.clone(),
        })
    }

    /// Resolve `transcript` under `level`.
    ///
    /// Only `UserCancelled` escapes; every other reasoning failure falls back
    /// to the pattern matcher, and no match is `Unknown` with confidence 0.
    pub async fn resolve(
        &self,
        transcript: &str,
        context: &ContextSnapshot,
        level: DegradationLevel,
        cancel: &CancellationToken,
    ) -> Result<Intent, FailureReason> {
        let allowed = level.allowed_tiers(Role::Intent);
        let registry = self.recovery.registry();

        if !self.catalog.intent.is_empty() && registry.select(Role::Intent, allowed).is_ok() {
            let request = ReasoningRequest {
                transcript: transcript.to_string(),
                context: context.clone(),
                language: self.language.clone(),
            };
            let request = &request;
            let result = self
                .recovery
                .execute(Role::Intent, allowed, &self.catalog.intent, cancel, |provider| async move {
                    provider.reason(request).await.and_then(validate)
                })
                .await;

            match result {
                Ok(attempted) => {
                    let mut intent = attempted.value;
                    intent.source = IntentSource::CloudReasoning;
                    info!(
                        "🧠 {} resolved '{}' -> {} ({:.2})",
                        attempted.provider, transcript, intent.action, intent.confidence
                    );
                    return Ok(self.snap_view(intent));
                }
                Err(FailureReason::UserCancelled) => return Err(FailureReason::UserCancelled),
                Err(reason) => {
                    warn!("⚠️ Reasoning failed ({}), using offline patterns", reason);
                }
            }
        } else {
            debug!("No reasoning provider allowed at level {}, using offline patterns", level);
        }

        if cancel.is_cancelled() {
            return Err(FailureReason::UserCancelled);
        }

        let intent = self.patterns.resolve(transcript);
        info!(
            "🧩 Offline resolved '{}' -> {} ({:.2})",
            transcript, intent.action, intent.confidence
        );
        Ok(self.snap_view(intent))
    }

    /// Offline-only resolution, exposed for tooling and tests
    pub fn patterns(&self) -> &PatternMatcher {
        &self.patterns
    }

    /// Replace a `Navigate` view with the closest known view
    fn snap_view(&self, mut intent: Intent) -> Intent {
        if intent.action != Action::Navigate || self.known_views.is_empty() {
            return intent;
        }
        let Some(spoken) = intent.entities.get("view").cloned() else {
            return intent;
        };
        match find_best_match(&spoken, &self.known_views, VIEW_MATCH_CUTOFF) {
            Some(best) if best.value != spoken => {
                debug!("View '{}' snapped to '{}' ({:.2})", spoken, best.value, best.score);
                if intent.source == IntentSource::OfflinePattern {
                    intent.raw_response_text = format!("Opening {}", best.value);
                }
                intent.entities.insert("view".to_string(), best.value);
            }
            Some(_) => {}
            None => debug!("View '{}' matches no known view", spoken),
        }
        intent
    }
}

/// Reject anything a provider returns outside the schema
fn validate(intent: Intent) -> Result<Intent, ProviderError> {
    if !(0.0..=1.0).contains(&intent.confidence) {
        return Err(ProviderError::Malformed(format!(
            "confidence {} out of range",
            intent.confidence
        )));
    }
    if intent.is_actionable() && intent.raw_response_text.trim().is_empty() {
        return Err(ProviderError::Malformed("missing response text".into()));
    }
    Ok(intent)
}
