//! Turn telemetry
//!
//! Every completed turn yields one [`VoiceTurnResult`], handed to each sink in
//! completion order. Results never carry audio.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

use crate::error::VoiceResult;
use crate::utterance::{SpokenResponse, VoiceTurnResult};

pub trait TelemetrySink: Send + Sync {
    fn record(&self, result: &VoiceTurnResult) -> VoiceResult<()>;
}

/// One log line per turn
#[derive(Debug, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, result: &VoiceTurnResult) -> VoiceResult<()> {
        let transcript = result
            .utterance
            .transcript
            .as_ref()
            .map(|t| t.text.as_str())
            .unwrap_or("");
        let action = result
            .intent
            .as_ref()
            .map(|i| i.action.as_str())
            .unwrap_or("-");
        let spoken = match &result.spoken_response {
            SpokenResponse::Spoken { cached: true, .. } => "spoken (cached)",
            SpokenResponse::Spoken { .. } => "spoken",
            SpokenResponse::TextOnly { .. } => "text",
            SpokenResponse::Silent => "silent",
        };

        match result.failure {
            Some(reason) => warn!(
                "📊 Turn {} [{}] failed: {} ('{}', {})",
                result.turn_id, result.degradation_level, reason, transcript, spoken
            ),
            None => info!(
                "📊 Turn {} [{}] '{}' -> {} ({})",
                result.turn_id, result.degradation_level, transcript, action, spoken
            ),
        }
        Ok(())
    }
}

/// Appends each result as a JSON line
#[derive(Debug)]
pub struct JsonlTelemetry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlTelemetry {
    pub fn new(path: impl Into<PathBuf>) -> VoiceResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }
}

impl TelemetrySink for JsonlTelemetry {
    fn record(&self, result: &VoiceTurnResult) -> VoiceResult<()> {
        let line = serde_json::to_string(result)?;
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

/// Keeps results in memory; used by the `status` command and tests
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    results: Mutex<Vec<VoiceTurnResult>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<VoiceTurnResult> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn record(&self, result: &VoiceTurnResult) -> VoiceResult<()> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result.clone());
        Ok(())
    }
}
