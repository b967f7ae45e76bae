//! Mock TTS provider and audio output for testing
//!
//! Records every synthesis request and every playback.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use fieldvoice::audio::AudioOutput;
use fieldvoice::error::ProviderError;
use fieldvoice::tts::{AudioPayload, TtsProvider};
use fieldvoice::VoiceResult;

/// Mock TTS that "synthesizes" the text bytes
pub struct MockTts {
    name: String,
    /// All text that was synthesized
    pub synthesized: Mutex<Vec<String>>,
    /// Simulate failure on every call
    pub should_fail: AtomicBool,
}

impl MockTts {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            synthesized: Mutex::new(Vec::new()),
            should_fail: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.synthesized.lock().unwrap().len()
    }

    pub fn was_synthesized(&self, text: &str) -> bool {
        self.synthesized.lock().unwrap().iter().any(|s| s == text)
    }
}

#[async_trait]
impl TtsProvider for MockTts {
    fn name(&self) -> &str {
        &self.name
    }

    async fn synthesize(&self, text: &str, _voice: &str) -> Result<AudioPayload, ProviderError> {
        self.synthesized.lock().unwrap().push(text.to_string());
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(ProviderError::Network("mock tts failure".into()));
        }
        Ok(AudioPayload::wav(text.as_bytes().to_vec()))
    }
}

/// Audio output that records what it was asked to play
#[derive(Default)]
pub struct RecordingOutput {
    pub played: Mutex<Vec<AudioPayload>>,
    pub stops: AtomicUsize,
    /// How long each playback takes
    pub playback: Mutex<Option<Duration>>,
}

impl RecordingOutput {
    pub fn played_texts(&self) -> Vec<String> {
        self.played
            .lock()
            .unwrap()
            .iter()
            .map(|p| String::from_utf8_lossy(&p.bytes).into_owned())
            .collect()
    }
}

#[async_trait]
impl AudioOutput for RecordingOutput {
    async fn play(&self, audio: &AudioPayload) -> VoiceResult<()> {
        self.played.lock().unwrap().push(audio.clone());
        let playback = *self.playback.lock().unwrap();
        if let Some(duration) = playback {
            tokio::time::sleep(duration).await;
        }
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}
