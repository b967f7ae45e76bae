//! Mock STT provider for testing
//!
//! Replays scripted results and counts calls. Reads the audio stream like a
//! streaming recognizer, emitting one scripted partial per chunk received.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use fieldvoice::asr::{InterimSink, SttProvider};
use fieldvoice::audio::AudioStream;
use fieldvoice::error::ProviderError;
use fieldvoice::utterance::FinalTranscript;

/// Mock STT that returns queued results, then repeats the last one
pub struct MockStt {
    name: String,
    script: Mutex<VecDeque<Result<FinalTranscript, ProviderError>>>,
    last: Mutex<Result<FinalTranscript, ProviderError>>,
    /// Partials emitted as audio arrives, one per chunk
    interims: Vec<(String, f32)>,
    /// Per-call latency, consumed in call order
    delays: Mutex<VecDeque<Duration>>,
    calls: AtomicUsize,
}

impl MockStt {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(Err(ProviderError::Unavailable("nothing scripted".into()))),
            interims: Vec::new(),
            delays: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always hear `text` with `confidence`
    pub fn hearing(name: &str, text: &str, confidence: f32) -> Self {
        Self::new(name).then(Ok(FinalTranscript::new(text, confidence)))
    }

    /// Always fail with `err`
    pub fn failing(name: &str, err: ProviderError) -> Self {
        Self::new(name).then(Err(err))
    }

    /// Queue one more result
    pub fn then(self, result: Result<FinalTranscript, ProviderError>) -> Self {
        *self.last.lock().unwrap() = result.clone();
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn with_interims(mut self, interims: &[(&str, f32)]) -> Self {
        self.interims = interims.iter().map(|(t, c)| (t.to_string(), *c)).collect();
        self
    }

    pub fn with_delays(self, delays: &[Duration]) -> Self {
        self.delays.lock().unwrap().extend(delays.iter().copied());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SttProvider for MockStt {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transcribe(
        &self,
        mut audio: AudioStream,
        _language: &str,
        interim: &InterimSink,
    ) -> Result<FinalTranscript, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut partials = self.interims.iter();
        while audio.next_chunk().await.is_some() {
            if let Some((text, confidence)) = partials.next() {
                interim.emit(text.clone(), *confidence);
            }
        }
        // Audio that arrived in one piece still gets every partial
        for (text, confidence) in partials {
            interim.emit(text.clone(), *confidence);
        }
        // Claim the result before sleeping so it follows call order
        let next = self.script.lock().unwrap().pop_front();
        let delay = self.delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        next.unwrap_or_else(|| self.last.lock().unwrap().clone())
    }
}
