//! Voice pipeline orchestration
//!
//! Wires the stages together and owns turn lifecycle:
//! capture -> recognition -> intent -> dispatch -> response -> telemetry.
//!
//! Each turn reads the degradation level once and uses it for every stage.
//! Turns may overlap (capture and recognition of the next utterance run while
//! the previous response plays) but intent resolution and dispatch follow
//! utterance start order.

pub mod sequencer;

use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::asr::{RecognitionEvent, RecognitionStage};
use crate::audio::{detect_segment_boundaries, start_capture, AudioOutput};
use crate::config::Config;
use crate::core::{Intent, IntentStage};
use crate::dispatch::{ActionDispatcher, ActionExecutor, ActionOutcome, ContextProvider, UserRecovery};
use crate::error::{FailureReason, VoiceResult};
use crate::mode::{Connectivity, DegradationLevel, ModeController};
use crate::providers::{HealthMonitor, ProviderCatalog, ProviderRegistry};
use crate::recovery::RecoveryEngine;
use crate::telemetry::TelemetrySink;
use crate::tts::ResponseStage;
use crate::utterance::{SpokenResponse, Utterance, VoiceTurnResult};

pub use sequencer::{DispatchSequencer, Ticket};

/// Everything the host application supplies
pub struct PipelineParts {
    pub registry: Arc<ProviderRegistry>,
    pub catalog: ProviderCatalog,
    pub connectivity: Arc<Connectivity>,
    pub executor: Arc<dyn ActionExecutor>,
    pub context: Arc<dyn ContextProvider>,
    pub output: Arc<dyn AudioOutput>,
    pub telemetry: Vec<Arc<dyn TelemetrySink>>,
}

pub struct VoicePipeline {
    config: Config,
    registry: Arc<ProviderRegistry>,
    catalog: Arc<ProviderCatalog>,
    mode: Arc<ModeController>,
    recognition: RecognitionStage,
    intent: IntentStage,
    dispatcher: ActionDispatcher,
    response: ResponseStage,
    context: Arc<dyn ContextProvider>,
    telemetry: Vec<Arc<dyn TelemetrySink>>,
    sequencer: DispatchSequencer,
    shutdown: CancellationToken,
    /// Cancelled by `stop_turn`; replaced with a fresh child afterwards
    turn_cancel: Mutex<CancellationToken>,
    next_turn: AtomicU64,
    next_text_id: AtomicU64,
}

/// How far a turn got before it ended
struct TurnState {
    turn_id: u64,
    level: DegradationLevel,
    utterance: Utterance,
    intent: Option<Intent>,
}

impl VoicePipeline {
    pub fn new(config: Config, parts: PipelineParts) -> VoiceResult<Arc<Self>> {
        let registry = parts.registry;
        let catalog = Arc::new(parts.catalog);
        let mode = Arc::new(ModeController::new(
            registry.clone(),
            parts.connectivity,
            &config.mode,
        ));
        let recovery = Arc::new(RecoveryEngine::new(
            registry.clone(),
            mode.clone(),
            &config.recovery,
        ));

        let recognition = RecognitionStage::new(recovery.clone(), catalog.clone(), &config.recognition);
        let intent = IntentStage::new(
            recovery.clone(),
            catalog.clone(),
            &config.intent,
            &config.recognition,
        )?;
        let response = ResponseStage::new(recovery, catalog.clone(), parts.output, &config.response);
        let shutdown = CancellationToken::new();

        Ok(Arc::new(Self {
            registry,
            catalog,
            mode,
            recognition,
            intent,
            dispatcher: ActionDispatcher::new(parts.executor),
            response,
            context: parts.context,
            telemetry: parts.telemetry,
            sequencer: DispatchSequencer::new(),
            turn_cancel: Mutex::new(shutdown.child_token()),
            shutdown,
            next_turn: AtomicU64::new(1),
            // Typed turns get ids far from captured utterance ids
            next_text_id: AtomicU64::new(1 << 32),
            config,
        }))
    }

    pub fn mode(&self) -> &Arc<ModeController> {
        &self.mode
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn response(&self) -> &ResponseStage {
        &self.response
    }

    /// Live recognition states, interims and terminal events
    pub fn recognition_events(&self) -> broadcast::Receiver<RecognitionEvent> {
        self.recognition.subscribe()
    }

    /// Start the mode controller, health monitor and connectivity probe
    pub fn start_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(
            self.mode.clone().run(self.shutdown.child_token()),
        ));

        let monitor = Arc::new(
            HealthMonitor::new(
                self.registry.clone(),
                self.catalog.clone(),
                self.mode.clone(),
                self.config.registry.health_interval(),
            )
            .with_timeouts(&self.config.recovery),
        );
        handles.push(tokio::spawn(monitor.run(self.shutdown.child_token())));

        let probe_url = self.config.mode.connectivity_probe_url.trim();
        if !probe_url.is_empty() {
            handles.push(self.mode.connectivity().clone().spawn_probe(
                probe_url.to_string(),
                Duration::from_secs(self.config.mode.connectivity_probe_interval_secs),
                self.shutdown.child_token(),
            ));
        }
        handles
    }

    /// Synthesize the pinned phrases at the current level
    pub async fn prewarm(&self) -> usize {
        let level = self.mode.current().level;
        self.response.prewarm(level, &self.shutdown).await
    }

    /// Abort whatever turn is in flight. Later turns are unaffected.
    pub fn stop_turn(&self) {
        let mut current = self.turn_cancel.lock().unwrap_or_else(PoisonError::into_inner);
        info!("🛑 Stop requested");
        current.cancel();
        *current = self.shutdown.child_token();
    }

    /// Stop background tasks and every turn
    pub fn shutdown(&self) {
        info!("👋 Pipeline shutting down");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn turn_token(&self) -> CancellationToken {
        self.turn_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Capture from the configured microphone until shutdown
    pub async fn listen(self: Arc<Self>) -> VoiceResult<()> {
        let capture = match start_capture(&self.config.audio) {
            Ok(capture) => capture,
            Err(e) => {
                error!("🎙️ Cannot start capture: {}", e);
                self.report_device_unavailable().await;
                return Err(e);
            }
        };
        let handle = capture.handle();
        let utterances = detect_segment_boundaries(capture, &self.config.audio);

        let shutdown = self.shutdown.clone();
        let stopper = tokio::spawn(async move {
            shutdown.cancelled().await;
            handle.stop();
        });

        info!("✅ Listening - speak a command");
        let result = self.run(utterances).await;
        stopper.abort();
        result
    }

    /// Run one turn per utterance until the stream ends or shutdown
    pub async fn run<S>(self: Arc<Self>, utterances: S) -> VoiceResult<()>
    where
        S: Stream<Item = Utterance> + Send,
    {
        let mut utterances = Box::pin(utterances);
        let mut turns = JoinSet::new();

        loop {
            let utterance = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(joined) = turns.join_next(), if !turns.is_empty() => {
                    if let Err(e) = joined {
                        warn!("⚠️ Turn task failed: {}", e);
                    }
                    continue;
                }
                next = utterances.next() => match next {
                    Some(utterance) => utterance,
                    None => break,
                },
            };
            // Issued here so tickets follow utterance start order
            let ticket = self.sequencer.issue();
            let pipeline = self.clone();
            turns.spawn(async move { pipeline.process(utterance, ticket).await });
        }

        while let Some(joined) = turns.join_next().await {
            if let Err(e) = joined {
                warn!("⚠️ Turn task failed: {}", e);
            }
        }
        debug!("Utterance stream finished");
        Ok(())
    }

    /// Run a single captured utterance through the pipeline
    pub async fn run_turn(&self, utterance: Utterance) -> VoiceTurnResult {
        let ticket = self.sequencer.issue();
        self.process(utterance, ticket).await
    }

    /// Typed command: skips recognition entirely
    pub async fn submit_text(&self, text: &str) -> VoiceTurnResult {
        let id = self.next_text_id.fetch_add(1, Ordering::SeqCst);
        let utterance = Utterance::from_text(id, text.trim(), Instant::now());
        self.run_turn(utterance).await
    }

    async fn process(&self, utterance: Utterance, mut ticket: Ticket) -> VoiceTurnResult {
        let cancel = self.turn_token();
        let mut state = TurnState {
            turn_id: self.next_turn.fetch_add(1, Ordering::SeqCst),
            level: self.mode.current().level,
            utterance,
            intent: None,
        };
        debug!(
            "▶️ Turn {} (utterance {}) at level {}",
            state.turn_id,
            state.utterance.id(),
            state.level
        );

        let transcript = match state.utterance.final_transcript().cloned() {
            Some(transcript) => transcript,
            None => match self
                .recognition
                .recognize(&mut state.utterance, state.level, &cancel)
                .await
            {
                Ok(transcript) => transcript,
                Err(reason) => {
                    drop(ticket);
                    return self.fail(state, reason, &cancel).await;
                }
            },
        };

        if let Err(reason) = ticket.wait_turn(&cancel).await {
            drop(ticket);
            return self.fail(state, reason, &cancel).await;
        }

        let context = self.context.snapshot();
        let intent = match self
            .intent
            .resolve(&transcript.text, &context, state.level, &cancel)
            .await
        {
            Ok(intent) => intent,
            Err(reason) => {
                drop(ticket);
                return self.fail(state, reason, &cancel).await;
            }
        };

        let dispatched = self.dispatcher.dispatch(&intent, &context).await;
        ticket.release();
        state.utterance.release_audio();
        state.intent = Some(intent);

        let spoken = self
            .response
            .speak(&dispatched.response_text, state.level, &cancel)
            .await;

        // The action already happened; a stop only cut the response short
        let failure = match spoken {
            SpokenResponse::Silent if cancel.is_cancelled() => {
                info!("🛑 Turn {} stopped during response", state.turn_id);
                Some(FailureReason::UserCancelled)
            }
            _ => None,
        };
        self.complete(state, dispatched.outcome, spoken, failure, dispatched.recovery)
    }

    /// End a turn on a stage failure, offering the mapped recovery
    async fn fail(
        &self,
        mut state: TurnState,
        reason: FailureReason,
        cancel: &CancellationToken,
    ) -> VoiceTurnResult {
        state.utterance.release_audio();
        let recovery = UserRecovery::for_failure(reason);
        info!("↩️ Turn {} failed: {} ({:?})", state.turn_id, reason, recovery);

        let spoken = match recovery {
            Some(recovery) => self.response.speak(recovery.prompt(), state.level, cancel).await,
            None => SpokenResponse::Silent,
        };
        self.complete(state, None, spoken, Some(reason), recovery)
    }

    fn complete(
        &self,
        mut state: TurnState,
        outcome: Option<ActionOutcome>,
        spoken: SpokenResponse,
        failure: Option<FailureReason>,
        recovery: Option<UserRecovery>,
    ) -> VoiceTurnResult {
        state.utterance.finish(Instant::now());
        let result = VoiceTurnResult {
            turn_id: state.turn_id,
            utterance: state.utterance.summary(),
            intent: state.intent,
            action_outcome: outcome,
            spoken_response: spoken,
            degradation_level: state.level,
            failure,
            recovery,
            completed_at: chrono::Utc::now(),
        };
        self.emit(&result);
        result
    }

    fn emit(&self, result: &VoiceTurnResult) {
        for sink in &self.telemetry {
            if let Err(e) = sink.record(result) {
                warn!("⚠️ Telemetry sink failed: {}", e);
            }
        }
    }

    /// Capture could not start: tell the user and record the failed turn
    async fn report_device_unavailable(&self) {
        let state = TurnState {
            turn_id: self.next_turn.fetch_add(1, Ordering::SeqCst),
            level: self.mode.current().level,
            utterance: Utterance::new(0, Instant::now()),
            intent: None,
        };
        let cancel = self.turn_token();
        self.fail(state, FailureReason::DeviceUnavailable, &cancel).await;
    }
}

impl Drop for VoicePipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

