//! FieldVoice - voice commands for field-service data entry
//!
//! Command-line front end: a microphone loop, one-off typed commands and a
//! provider status dump. Actions go to a console executor that keeps a small
//! in-memory context.

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fieldvoice::asr::{RecognitionEvent, WhisperStt, WyomingStt};
use fieldvoice::audio::SoundEngine;
use fieldvoice::core::{Action, OllamaReasoner};
use fieldvoice::dispatch::{ActionExecutor, ActionOutcome, ContextProvider, ContextSnapshot};
use fieldvoice::mode::{Connectivity, ModeController};
use fieldvoice::providers::{HealthMonitor, ProviderCatalog, ProviderRegistry, Tier};
use fieldvoice::telemetry::{JsonlTelemetry, TelemetrySink, TracingTelemetry};
use fieldvoice::tts::{CloudTts, PiperTts};
use fieldvoice::{Config, PipelineParts, VoicePipeline};

/// How many past actions the console context remembers
const HISTORY_LEN: usize = 10;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Audio input device index
    #[arg(short, long)]
    device: Option<usize>,

    /// Start offline: local providers only, no connectivity probe
    #[arg(long)]
    offline: bool,

    /// Config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen on the microphone and run voice commands
    Listen,
    /// Run one typed command through the pipeline
    Say {
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Check every provider and print the degradation level
    Status,
}

/// Prints actions and tracks the view and active record they touch
#[derive(Default)]
struct ConsoleApp {
    state: Mutex<ContextSnapshot>,
}

impl ContextProvider for ConsoleApp {
    fn snapshot(&self) -> ContextSnapshot {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ActionExecutor for ConsoleApp {
    async fn execute(
        &self,
        action: Action,
        entities: &BTreeMap<String, String>,
        _context: &ContextSnapshot,
    ) -> ActionOutcome {
        let get = |slot: &str| entities.get(slot).cloned();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let outcome = match action {
            Action::Navigate => match get("view") {
                Some(view) => {
                    state.current_view = Some(view.clone());
                    ActionOutcome::ok(format!("opened {}", view))
                }
                None => ActionOutcome::failed("no view given"),
            },
            Action::CreateRecord => match get("title") {
                Some(title) => {
                    state.active_record_id = Some(title.clone());
                    let kind = get("kind").unwrap_or_else(|| "record".to_string());
                    ActionOutcome::ok(format!("created {} {}", kind, title))
                }
                None => ActionOutcome::failed("the new record needs a name"),
            },
            Action::SetActiveContext => match get("record") {
                Some(record) => {
                    state.active_record_id = Some(record.clone());
                    ActionOutcome::ok(format!("active record {}", record))
                }
                None => ActionOutcome::failed("no record given"),
            },
            Action::AddEntry => match &state.active_record_id {
                Some(record) => ActionOutcome::ok(format!("entry added to {}", record)),
                None if entities.contains_key("target") => ActionOutcome::ok("entry added"),
                None => ActionOutcome::failed("no active record"),
            },
            Action::Query => ActionOutcome::ok("query sent"),
            Action::Unknown => ActionOutcome::failed("unknown action"),
        };

        if outcome.success {
            state.recent_action_history.push(action.to_string());
            let overflow = state.recent_action_history.len().saturating_sub(HISTORY_LEN);
            state.recent_action_history.drain(..overflow);
        }
        println!("➡️  {} {:?} -> {}", action, entities, outcome.detail);
        outcome
    }
}

fn init_logging(verbose: bool, configured: &str) -> Result<()> {
    let level = if verbose {
        "debug"
    } else if configured.trim().is_empty() {
        "info"
    } else {
        configured.trim()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Register every enabled provider
fn build_catalog(config: &Config, registry: &ProviderRegistry) -> ProviderCatalog {
    let p = &config.providers;
    let mut catalog = ProviderCatalog::new();

    if p.wyoming_enabled {
        catalog.add_stt(
            registry,
            p.wyoming_priority,
            Tier::Local,
            Arc::new(WyomingStt::new(&p.wyoming_host, p.wyoming_port)),
        );
    }
    if p.whisper_enabled {
        if p.api_key.is_empty() {
            warn!("⚠️ Whisper enabled without an API key");
        }
        catalog.add_stt(
            registry,
            p.whisper_priority,
            Tier::Network,
            Arc::new(WhisperStt::new(&p.whisper_url, &p.api_key, &p.whisper_model)),
        );
    }
    if p.ollama_enabled {
        catalog.add_reasoner(
            registry,
            p.ollama_priority,
            Tier::Network,
            Arc::new(OllamaReasoner::new(&p.ollama_url, &p.ollama_model)),
        );
    }
    if p.piper_enabled {
        catalog.add_tts(
            registry,
            p.piper_priority,
            Tier::Local,
            Arc::new(PiperTts::new(&p.piper_binary, &p.piper_voice)),
        );
    }
    if p.cloud_tts_enabled {
        catalog.add_tts(
            registry,
            p.cloud_tts_priority,
            Tier::Network,
            Arc::new(CloudTts::new(&p.cloud_tts_url, &p.api_key, &p.cloud_tts_model)),
        );
    }
    catalog
}

fn telemetry_sinks(config: &Config) -> Vec<Arc<dyn TelemetrySink>> {
    let mut sinks: Vec<Arc<dyn TelemetrySink>> = vec![Arc::new(TracingTelemetry)];
    if config.telemetry.enabled {
        match JsonlTelemetry::new(&config.telemetry.path) {
            Ok(sink) => sinks.push(Arc::new(sink)),
            Err(e) => warn!("⚠️ Turn log disabled: {}", e),
        }
    }
    sinks
}

fn build_pipeline(config: Config, offline: bool) -> Result<Arc<VoicePipeline>> {
    let registry = Arc::new(ProviderRegistry::new(&config.registry));
    let catalog = build_catalog(&config, &registry);
    let app = Arc::new(ConsoleApp::default());

    let parts = PipelineParts {
        catalog,
        connectivity: Arc::new(Connectivity::new(!offline)),
        executor: app.clone(),
        context: app,
        output: Arc::new(SoundEngine::new()?),
        telemetry: telemetry_sinks(&config),
        registry,
    };
    Ok(VoicePipeline::new(config, parts)?)
}

async fn listen(config: Config, offline: bool) -> Result<()> {
    let pipeline = build_pipeline(config, offline)?;
    let background = pipeline.start_background();
    pipeline.prewarm().await;

    let mut events = pipeline.recognition_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let RecognitionEvent::Interim { text, .. } = event {
                debug!("… {}", text);
            }
        }
    });

    let stopper = pipeline.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.shutdown();
        }
    });

    let result = pipeline.clone().listen().await;
    pipeline.shutdown();
    for handle in background {
        let _ = handle.await;
    }
    Ok(result?)
}

async fn say(config: Config, offline: bool, text: &str) -> Result<()> {
    let pipeline = build_pipeline(config, offline)?;
    let background = pipeline.start_background();

    let result = pipeline.submit_text(text).await;
    if let Some(text) = result.spoken_response.text() {
        println!("🗣️  {}", text);
    }
    println!("{}", serde_json::to_string_pretty(&result)?);

    pipeline.shutdown();
    for handle in background {
        let _ = handle.await;
    }
    Ok(())
}

async fn status(config: Config, offline: bool) -> Result<()> {
    let registry = Arc::new(ProviderRegistry::new(&config.registry));
    let catalog = build_catalog(&config, &registry);
    let mode = Arc::new(ModeController::new(
        registry.clone(),
        Arc::new(Connectivity::new(!offline)),
        &config.mode,
    ));
    let monitor = HealthMonitor::new(
        registry.clone(),
        Arc::new(catalog),
        mode.clone(),
        config.registry.health_interval(),
    )
    .with_timeouts(&config.recovery);
    monitor.check_all().await;

    let snapshot = mode.current();
    println!(
        "Degradation level: {} ({})",
        snapshot.level,
        if snapshot.online { "online" } else { "offline" }
    );
    let now = Instant::now();
    for descriptor in registry.descriptors() {
        println!(
            "  {:<6} {:<10} priority {:<3} {:<8} {}",
            descriptor.role.to_string(),
            descriptor.name,
            descriptor.priority,
            format!("{:?}", descriptor.tier),
            if registry.is_viable(&descriptor, now) {
                "✅ viable"
            } else {
                "❌ tripped"
            }
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(device) = args.device {
        config.audio.device_index = Some(device);
    }
    if args.offline {
        config.mode.connectivity_probe_url.clear();
    }

    init_logging(args.verbose, &config.log_level)?;
    info!("🎙️ FieldVoice v{} starting...", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Listen => listen(config, args.offline).await,
        Command::Say { text } => say(config, args.offline, &text.join(" ")).await,
        Command::Status => status(config, args.offline).await,
    }
}
