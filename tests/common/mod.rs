#![allow(dead_code)]

pub mod mock_reasoner;
pub mod mock_stt;
pub mod mock_tts;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use fieldvoice::core::Action;
use fieldvoice::dispatch::{ActionExecutor, ActionOutcome, ContextProvider, ContextSnapshot};
use fieldvoice::mode::Connectivity;
use fieldvoice::providers::{ProviderCatalog, ProviderRegistry, Tier};
use fieldvoice::telemetry::{MemoryTelemetry, TelemetrySink};
use fieldvoice::utterance::{AudioBuffer, Utterance};
use fieldvoice::{Config, PipelineParts, VoicePipeline};

pub use mock_reasoner::MockReasoner;
pub use mock_stt::MockStt;
pub use mock_tts::{MockTts, RecordingOutput};

pub const SAMPLE_RATE: u32 = 16_000;

/// Host application double: records actions and serves a fixed context
#[derive(Default)]
pub struct MockApp {
    pub executed: Mutex<Vec<(Action, BTreeMap<String, String>)>>,
    pub context: Mutex<ContextSnapshot>,
}

impl MockApp {
    pub fn actions(&self) -> Vec<Action> {
        self.executed.lock().unwrap().iter().map(|(a, _)| *a).collect()
    }
}

impl ContextProvider for MockApp {
    fn snapshot(&self) -> ContextSnapshot {
        self.context.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionExecutor for MockApp {
    async fn execute(
        &self,
        action: Action,
        entities: &BTreeMap<String, String>,
        _context: &ContextSnapshot,
    ) -> ActionOutcome {
        self.executed.lock().unwrap().push((action, entities.clone()));
        ActionOutcome::ok(format!("{} done", action))
    }
}

/// A second of quiet speech-level audio
pub fn speech(id: u64) -> Utterance {
    let now = Instant::now();
    let audio = AudioBuffer::new(vec![0.1; SAMPLE_RATE as usize], SAMPLE_RATE);
    Utterance::with_audio(id, audio, now, now)
}

pub struct Harness {
    pub pipeline: Arc<VoicePipeline>,
    pub registry: Arc<ProviderRegistry>,
    pub connectivity: Arc<Connectivity>,
    pub app: Arc<MockApp>,
    pub output: Arc<RecordingOutput>,
    pub telemetry: Arc<MemoryTelemetry>,
}

pub struct HarnessBuilder {
    config: Config,
    online: bool,
    registry: Arc<ProviderRegistry>,
    catalog: ProviderCatalog,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        let mut config = Config::default();
        config.telemetry.enabled = false;
        config.mode.connectivity_probe_url.clear();
        let registry = Arc::new(ProviderRegistry::new(&config.registry));
        Self {
            config,
            online: true,
            registry,
            catalog: ProviderCatalog::new(),
        }
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }

    pub fn config(mut self, edit: impl FnOnce(&mut Config)) -> Self {
        edit(&mut self.config);
        self
    }

    pub fn stt(mut self, priority: u32, tier: Tier, provider: Arc<MockStt>) -> Self {
        self.catalog.add_stt(&self.registry, priority, tier, provider);
        self
    }

    pub fn reasoner(mut self, priority: u32, tier: Tier, provider: Arc<MockReasoner>) -> Self {
        self.catalog.add_reasoner(&self.registry, priority, tier, provider);
        self
    }

    pub fn tts(mut self, priority: u32, tier: Tier, provider: Arc<MockTts>) -> Self {
        self.catalog.add_tts(&self.registry, priority, tier, provider);
        self
    }

    pub fn build(self) -> Harness {
        let connectivity = Arc::new(Connectivity::new(self.online));
        let app = Arc::new(MockApp::default());
        let output = Arc::new(RecordingOutput::default());
        let telemetry = Arc::new(MemoryTelemetry::new());

        let pipeline = VoicePipeline::new(
            self.config,
            PipelineParts {
                registry: self.registry.clone(),
                catalog: self.catalog,
                connectivity: connectivity.clone(),
                executor: app.clone(),
                context: app.clone(),
                output: output.clone(),
                telemetry: vec![telemetry.clone() as Arc<dyn TelemetrySink>],
            },
        )
        .expect("pipeline builds");

        Harness {
            pipeline,
            registry: self.registry,
            connectivity,
            app,
            output,
            telemetry,
        }
    }
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}
