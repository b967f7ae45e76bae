//! Piper TTS backend calling a local binary

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, warn};

use super::{AudioPayload, TtsProvider};
use crate::error::ProviderError;

static NEXT_OUTPUT: AtomicU64 = AtomicU64::new(0);

/// Local neural TTS; synthesizes to a temporary WAV and reads it back
#[derive(Debug)]
pub struct PiperTts {
    binary: String,
    voices_dir: PathBuf,
    default_voice: String,
}

impl PiperTts {
    pub fn new(binary: &str, default_voice: &str) -> Self {
        let voices_dir = dirs::data_dir().unwrap_or_default().join("fieldvoice/voices");
        Self::with_voices_dir(binary, default_voice, voices_dir)
    }

    pub fn with_voices_dir(binary: &str, default_voice: &str, voices_dir: PathBuf) -> Self {
        let piper = Self {
            binary: binary.to_string(),
            voices_dir,
            default_voice: default_voice.to_string(),
        };
        let model = piper.model_path(default_voice);
        if !model.exists() {
            warn!("⚠️ Piper model not found at {}", model.display());
        }
        piper
    }

    /// Voices not installed locally (e.g. cloud voice names) fall back to the default
    fn model_path(&self, voice: &str) -> PathBuf {
        let requested = self.voices_dir.join(format!("{}.onnx", voice));
        if requested.exists() {
            requested
        } else {
            self.voices_dir.join(format!("{}.onnx", self.default_voice))
        }
    }

    fn output_path() -> PathBuf {
        std::env::temp_dir().join(format!(
            "fieldvoice_speech_{}_{}.wav",
            std::process::id(),
            NEXT_OUTPUT.fetch_add(1, Ordering::Relaxed)
        ))
    }

    async fn run(&self, model: &Path, text: &str, wav_path: &Path) -> Result<(), ProviderError> {
        // kill_on_drop: a cancelled or timed-out turn takes the child with it
        let mut child = Command::new(&self.binary)
            .arg("-m")
            .arg(model)
            .arg("-f")
            .arg(wav_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!("❌ Failed to spawn {}: {}", self.binary, e);
                ProviderError::Unavailable(format!("failed to spawn {}: {}", self.binary, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(ProviderError::Unavailable(format!(
                "piper failed with status {}",
                status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TtsProvider for PiperTts {
    fn name(&self) -> &str {
        "piper"
    }

    async fn synthesize(&self, text: &str, voice: &str) -> Result<AudioPayload, ProviderError> {
        let model = self.model_path(voice);
        if !model.exists() {
            return Err(ProviderError::Unavailable(format!(
                "piper model missing: {}",
                model.display()
            )));
        }

        let wav_path = Self::output_path();
        let result = self.run(&model, text, &wav_path).await;
        let bytes = match result {
            Ok(()) => tokio::fs::read(&wav_path).await.map_err(|e| {
                ProviderError::Malformed(format!("piper output not readable: {}", e))
            }),
            Err(e) => Err(e),
        };
        let _ = tokio::fs::remove_file(&wav_path).await;

        let bytes = bytes?;
        if bytes.len() <= 44 {
            return Err(ProviderError::Malformed("piper produced an empty WAV".into()));
        }
        debug!("✅ Piper synthesized {} bytes for '{}'", bytes.len(), text);
        Ok(AudioPayload::wav(bytes))
    }

    async fn health_check(&self) -> bool {
        self.model_path(&self.default_voice).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_voice_uses_default_model() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("en_US-lessac-medium.onnx"), b"model").unwrap();
        let piper = PiperTts::with_voices_dir("piper-tts", "en_US-lessac-medium", dir.path().to_path_buf());

        assert_eq!(
            piper.model_path("alloy"),
            dir.path().join("en_US-lessac-medium.onnx")
        );
    }

    #[test]
    fn test_output_paths_unique() {
        assert_ne!(PiperTts::output_path(), PiperTts::output_path());
    }

    #[tokio::test]
    async fn test_missing_model_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let piper = PiperTts::with_voices_dir("piper-tts", "missing", dir.path().to_path_buf());
        assert!(!piper.health_check().await);
        let err = piper.synthesize("Done.", "missing").await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }
}
