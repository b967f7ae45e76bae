//! Recognition Stage
//!
//! Drives one utterance through `Idle -> Listening -> Transcribing ->
//! Finalized | Failed`, publishing every transition on a broadcast channel.
//! Each utterance gets exactly one terminal event.
//!
//! Recognition starts while the segment is still open. The stage stays in
//! `Listening` until the segment closes, and interims published in that
//! window come from audio the user is still producing.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{InterimSink, RecognitionEvent, RecognitionState};
use crate::config::RecognitionConfig;
use crate::error::FailureReason;
use crate::mode::DegradationLevel;
use crate::providers::{ProviderCatalog, Role};
use crate::recovery::RecoveryEngine;
use crate::utterance::{FinalTranscript, Utterance};

const EVENT_CAPACITY: usize = 256;

pub struct RecognitionStage {
    recovery: Arc<RecoveryEngine>,
    catalog: Arc<ProviderCatalog>,
    confidence_floor: f32,
    language: String,
    events: broadcast::Sender<RecognitionEvent>,
}

impl RecognitionStage {
    pub fn new(
        recovery: Arc<RecoveryEngine>,
        catalog: Arc<ProviderCatalog>,
        config: &RecognitionConfig,
    ) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            recovery,
            catalog,
            confidence_floor: config.confidence_floor,
            language: config.language.clone(),
            events,
        }
    }

    /// Live feed of states, interims and terminal results
    pub fn subscribe(&self) -> broadcast::Receiver<RecognitionEvent> {
        self.events.subscribe()
    }

    /// Produce the final transcript for `utterance` at the given level.
    ///
    /// The level is read by the caller once per turn. Interim transcripts are
    /// appended to the utterance as they arrive.
    pub async fn recognize(
        &self,
        utterance: &mut Utterance,
        level: DegradationLevel,
        cancel: &CancellationToken,
    ) -> Result<FinalTranscript, FailureReason> {
        let id = utterance.id();
        self.publish_state(id, RecognitionState::Listening);

        if level == DegradationLevel::Disabled {
            info!("🔇 Recognition disabled, skipping utterance {}", id);
            return self.fail(id, FailureReason::NoProviderAvailable);
        }

        let Some(audio) = utterance.audio() else {
            warn!("⚠️ Utterance {} has no audio", id);
            return self.fail(id, FailureReason::LowConfidence);
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = InterimSink::new(tx);
        let language = self.language.as_str();

        // Each attempt streams the utterance from its first sample; the
        // timeout only runs once speech has ended
        let call = self.recovery.execute_armed(
            Role::Stt,
            level.allowed_tiers(Role::Stt),
            &self.catalog.stt,
            cancel,
            || {
                let audio = audio.clone();
                async move { audio.closed().await }
            },
            |provider| {
                let stream = audio.stream();
                let sink = sink.clone();
                async move { provider.transcribe(stream, language, &sink).await }
            },
        );
        tokio::pin!(call);

        let mut listening = true;
        let speech_ended = audio.closed();
        tokio::pin!(speech_ended);

        let result = loop {
            tokio::select! {
                biased;
                Some((text, confidence)) = rx.recv() => {
                    self.record_interim(utterance, text, confidence);
                }
                _ = &mut speech_ended, if listening => {
                    listening = false;
                    self.publish_state(id, RecognitionState::Transcribing);
                }
                result = &mut call => break result,
            }
        };
        // Partials queued before the provider returned still precede the terminal event
        while let Ok((text, confidence)) = rx.try_recv() {
            self.record_interim(utterance, text, confidence);
        }

        let attempted = match result {
            Ok(attempted) => attempted,
            Err(reason) => return self.fail(id, reason),
        };

        let transcript = attempted.value;
        if !self.trusted(&transcript) {
            info!(
                "🤔 Untrusted transcript '{}' ({:.2}, floor {:.2})",
                transcript.text, transcript.confidence, self.confidence_floor
            );
            return self.fail(id, FailureReason::LowConfidence);
        }

        utterance.set_final(transcript.clone());
        info!(
            "📝 Final transcript via {}: '{}' ({:.2})",
            attempted.provider, transcript.text, transcript.confidence
        );
        self.publish_state(id, RecognitionState::Finalized);
        let _ = self.events.send(RecognitionEvent::Finalized {
            utterance_id: id,
            transcript: transcript.clone(),
            provider: attempted.provider,
        });
        Ok(transcript)
    }

    /// Confidence must be a real probability at or above the floor
    fn trusted(&self, transcript: &FinalTranscript) -> bool {
        (0.0..=1.0).contains(&transcript.confidence)
            && transcript.confidence >= self.confidence_floor
            && !transcript.text.trim().is_empty()
    }

    fn record_interim(&self, utterance: &mut Utterance, text: String, confidence: f32) {
        let utterance_id = utterance.id();
        let interim = utterance.push_interim(text, confidence, Instant::now());
        debug!("… interim '{}' ({:.2})", interim.text, interim.confidence);
        let _ = self.events.send(RecognitionEvent::Interim {
            utterance_id,
            text: interim.text.clone(),
            confidence: interim.confidence,
            at: interim.at,
        });
    }

    fn publish_state(&self, utterance_id: u64, state: RecognitionState) {
        let _ = self.events.send(RecognitionEvent::State {
            utterance_id,
            state,
        });
    }

    fn fail(&self, utterance_id: u64, reason: FailureReason) -> Result<FinalTranscript, FailureReason> {
        self.publish_state(utterance_id, RecognitionState::Failed(reason));
        let _ = self.events.send(RecognitionEvent::Failed {
            utterance_id,
            reason,
        });
        Err(reason)
    }
}
