use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ErrorClass;
use crate::recovery::{Backoff, Fallback, RecoveryPolicy};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub registry: RegistryConfig,
    pub mode: ModeConfig,
    pub recovery: RecoveryConfig,
    pub recognition: RecognitionConfig,
    pub intent: IntentConfig,
    pub response: ResponseConfig,
    pub providers: ProvidersConfig,
    pub telemetry: TelemetryConfig,

    // Meta
    pub log_level: String,
}

/// Microphone and conditioning chain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device index, `None` for the system default
    pub device_index: Option<usize>,
    pub sample_rate: u32,
    pub chunk_size: usize,
    pub high_pass_hz: f32,
    pub band_low_hz: f32,
    pub band_high_hz: f32,
    /// Compressor threshold as linear amplitude (0.0 - 1.0)
    pub compressor_threshold: f32,
    pub compressor_ratio: f32,
    pub makeup_gain: f32,
    /// Noise gate threshold as frame RMS (0.0 - 1.0)
    pub noise_gate_threshold: f32,
    pub silence_timeout_ms: u64,
    pub min_utterance_ms: u64,
    pub max_utterance_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device_index: None,
            sample_rate: 16000,
            chunk_size: 320,
            high_pass_hz: 80.0,
            band_low_hz: 300.0,
            band_high_hz: 3400.0,
            compressor_threshold: 0.5,
            compressor_ratio: 4.0,
            makeup_gain: 1.5,
            noise_gate_threshold: 0.02,
            silence_timeout_ms: 800,
            min_utterance_ms: 200,
            max_utterance_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub trip_threshold: u32,
    pub failure_window_secs: u64,
    pub health_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            trip_threshold: 3,
            failure_window_secs: 60,
            health_interval_secs: 30,
        }
    }
}

impl RegistryConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    pub evaluation_interval_secs: u64,
    /// URL probed to decide connectivity; empty disables the probe
    pub connectivity_probe_url: String,
    pub connectivity_probe_interval_secs: u64,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: 30,
            connectivity_probe_url: String::new(),
            connectivity_probe_interval_secs: 15,
        }
    }
}

impl ModeConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub policies: HashMap<ErrorClass, RecoveryPolicy>,
    pub stt_timeout_ms: u64,
    pub intent_timeout_ms: u64,
    pub tts_timeout_ms: u64,
    /// Random jitter added to exponential backoff delays
    pub backoff_jitter_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            policies: default_policies(),
            stt_timeout_ms: 10_000,
            intent_timeout_ms: 8_000,
            tts_timeout_ms: 5_000,
            backoff_jitter_ms: 0,
        }
    }
}

/// Policy table for each error class
pub fn default_policies() -> HashMap<ErrorClass, RecoveryPolicy> {
    HashMap::from([
        (
            ErrorClass::Transient,
            RecoveryPolicy {
                retries: 2,
                backoff: Backoff::Exponential {
                    base_ms: 250,
                    factor: 2,
                },
                fallback: Fallback::NextProvider,
            },
        ),
        (
            ErrorClass::LowConfidence,
            RecoveryPolicy {
                retries: 0,
                backoff: Backoff::None,
                fallback: Fallback::PromptRepeat,
            },
        ),
        (
            ErrorClass::NoProvider,
            RecoveryPolicy {
                retries: 0,
                backoff: Backoff::None,
                fallback: Fallback::DemoteMode,
            },
        ),
        (
            ErrorClass::Malformed,
            RecoveryPolicy {
                retries: 1,
                backoff: Backoff::Immediate,
                fallback: Fallback::NextProvider,
            },
        ),
        (
            ErrorClass::Cancelled,
            RecoveryPolicy {
                retries: 0,
                backoff: Backoff::None,
                fallback: Fallback::Abort,
            },
        ),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub confidence_floor: f32,
    pub language: String,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.4,
            language: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    /// Fixed confidence reported for offline pattern matches
    pub pattern_confidence: f32,
    /// Views the `Navigate` action can target
    pub known_views: Vec<String>,
    /// Frequent recognition errors and their replacement
    pub corrections: HashMap<String, String>,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            pattern_confidence: 0.7,
            known_views: [
                "jobs",
                "schedule",
                "customers",
                "invoices",
                "quotes",
                "inventory",
                "timesheet",
                "settings",
                "dashboard",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            corrections: HashMap::from([
                ("jab".to_string(), "job".to_string()),
                ("in voice".to_string(), "invoice".to_string()),
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    pub cache_capacity: usize,
    /// Phrases synthesized at startup and never evicted
    pub pinned_phrases: Vec<String>,
    pub voice: String,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 200,
            pinned_phrases: vec![
                crate::dispatch::DONE_PHRASE.to_string(),
                "Okay.".to_string(),
                crate::dispatch::REPEAT_PROMPT.to_string(),
                crate::dispatch::CLARIFICATION_PROMPT.to_string(),
                crate::dispatch::TEXT_INPUT_PROMPT.to_string(),
            ],
            voice: "alloy".to_string(),
        }
    }
}

/// Endpoints and credentials for the concrete providers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    // Wyoming (local faster-whisper server)
    pub wyoming_enabled: bool,
    pub wyoming_host: String,
    pub wyoming_port: u16,
    pub wyoming_priority: u32,

    // OpenAI-compatible transcription
    pub whisper_enabled: bool,
    pub whisper_url: String,
    pub whisper_model: String,
    pub whisper_priority: u32,

    // Cloud reasoning
    pub ollama_enabled: bool,
    pub ollama_url: String,
    pub ollama_model: String,
    pub ollama_priority: u32,

    // Piper (local synthesis)
    pub piper_enabled: bool,
    pub piper_binary: String,
    pub piper_voice: String,
    pub piper_priority: u32,

    // OpenAI-compatible speech synthesis
    pub cloud_tts_enabled: bool,
    pub cloud_tts_url: String,
    pub cloud_tts_model: String,
    pub cloud_tts_priority: u32,

    pub api_key: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            wyoming_enabled: true,
            wyoming_host: "localhost".to_string(),
            wyoming_port: 10300,
            wyoming_priority: 2,
            whisper_enabled: false,
            whisper_url: "https://api.openai.com".to_string(),
            whisper_model: "whisper-1".to_string(),
            whisper_priority: 1,
            ollama_enabled: false,
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3".to_string(),
            ollama_priority: 1,
            piper_enabled: true,
            piper_binary: "piper-tts".to_string(),
            piper_voice: "en_US-lessac-medium".to_string(),
            piper_priority: 2,
            cloud_tts_enabled: false,
            cloud_tts_url: "https://api.openai.com".to_string(),
            cloud_tts_model: "tts-1".to_string(),
            cloud_tts_priority: 1,
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: dirs::data_dir()
                .unwrap_or_default()
                .join("fieldvoice/turns.jsonl")
                .to_string_lossy()
                .to_string(),
        }
    }
}

impl Config {
    /// Load config from the default location, or create default
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    /// Load config from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)?;
        match serde_json::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                // Graceful degradation: log warning and use defaults
                tracing::warn!("⚠️ Config file corrupted or invalid, using defaults: {}", e);
                let backup_path = config_path.with_extension("json.corrupt");
                let _ = std::fs::rename(config_path, &backup_path);
                Ok(Self::default())
            }
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldvoice")
        .join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.audio.silence_timeout_ms, 800);
        assert_eq!(config.registry.trip_threshold, 3);
        assert_eq!(config.registry.failure_window_secs, 60);
        assert_eq!(config.mode.evaluation_interval_secs, 30);
        assert_eq!(config.response.cache_capacity, 200);
        assert!((config.recognition.confidence_floor - 0.4).abs() < f32::EPSILON);
        assert!((config.intent.pattern_confidence - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.recovery.stt_timeout_ms, 10_000);
        assert_eq!(config.recovery.intent_timeout_ms, 8_000);
        assert_eq!(config.recovery.tts_timeout_ms, 5_000);
    }

    #[test]
    fn test_default_policy_table() {
        let policies = default_policies();
        let transient = &policies[&ErrorClass::Transient];
        assert_eq!(transient.retries, 2);
        assert_eq!(transient.fallback, Fallback::NextProvider);
        assert_eq!(policies[&ErrorClass::Malformed].retries, 1);
        assert_eq!(policies[&ErrorClass::Malformed].backoff, Backoff::Immediate);
        assert_eq!(policies[&ErrorClass::LowConfidence].retries, 0);
        assert_eq!(
            policies[&ErrorClass::NoProvider].fallback,
            Fallback::DemoteMode
        );
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string(&config).expect("Failed to serialize");
        let restored: Config = serde_json::from_str(&json).expect("Failed to deserialize");
        assert_eq!(config.providers.wyoming_port, restored.providers.wyoming_port);
        assert_eq!(
            restored.recovery.policies[&ErrorClass::Transient].retries,
            2
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{ "recognition": { "confidence_floor": 0.6 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!((config.recognition.confidence_floor - 0.6).abs() < f32::EPSILON);
        assert_eq!(config.recognition.language, "en");
        assert_eq!(config.audio.sample_rate, 16000);
    }

    #[test]
    fn test_config_corrupt_json_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not valid json").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.response.cache_capacity, 200);
        assert!(path.with_extension("json.corrupt").exists());
        assert!(!path.exists());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let mut config = Config::default();
        config.intent.pattern_confidence = 0.55;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert!((loaded.intent.pattern_confidence - 0.55).abs() < f32::EPSILON);
    }
}
