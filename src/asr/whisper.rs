//! OpenAI-compatible HTTP transcription

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{InterimSink, SttProvider};
use crate::audio::AudioStream;
use crate::error::ProviderError;
use crate::utterance::FinalTranscript;

/// Whisper transcription provider (network tier)
pub struct WhisperStt {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
    #[serde(default)]
    segments: Vec<Segment>,
}

#[derive(Debug, Deserialize)]
struct Segment {
    text: String,
    avg_logprob: f32,
    #[serde(default)]
    no_speech_prob: f32,
}

impl WhisperStt {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    /// Mean per-segment probability, discounted by the no-speech estimate
    fn confidence(response: &TranscriptionResponse) -> f32 {
        if response.text.trim().is_empty() {
            return 0.0;
        }
        if response.segments.is_empty() {
            return 1.0;
        }
        let total: f32 = response
            .segments
            .iter()
            .map(|s| s.avg_logprob.exp() * (1.0 - s.no_speech_prob))
            .sum();
        (total / response.segments.len() as f32).clamp(0.0, 1.0)
    }
}

#[async_trait]
impl SttProvider for WhisperStt {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn transcribe(
        &self,
        audio: AudioStream,
        language: &str,
        interim: &InterimSink,
    ) -> Result<FinalTranscript, ProviderError> {
        // The HTTP API takes a whole file
        let audio = audio.collect().await;
        let wav = audio
            .to_wav()
            .map_err(|e| ProviderError::Malformed(format!("WAV encoding failed: {}", e)))?;

        let part = Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| ProviderError::Malformed(format!("Invalid MIME type: {}", e)))?;

        let form = Form::new()
            .text("model", self.model.clone())
            .text("language", language.to_string())
            .text("response_format", "verbose_json")
            .part("file", part);

        let response = self
            .client
            .post(format!("{}/v1/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("❌ Whisper API error ({}): {}", status, body);
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => ProviderError::QuotaExceeded(body),
                s if s.is_server_error() => ProviderError::Unavailable(format!("{}: {}", s, body)),
                s => ProviderError::Network(format!("{}: {}", s, body)),
            });
        }

        let body = response.text().await?;
        let parsed: TranscriptionResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Malformed(format!("Whisper response: {}", e)))?;

        let mut partial = String::new();
        for segment in &parsed.segments {
            partial.push_str(&segment.text);
            interim.emit(partial.trim(), segment.avg_logprob.exp());
        }

        let confidence = Self::confidence(&parsed);
        debug!("Whisper transcript '{}' ({:.2})", parsed.text.trim(), confidence);
        Ok(FinalTranscript::new(parsed.text.trim(), confidence))
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(format!("{}/v1/models", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> TranscriptionResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_confidence_from_segments() {
        let response = parse(
            r#"{"text": "open jobs", "segments": [
                {"text": "open", "avg_logprob": 0.0, "no_speech_prob": 0.0},
                {"text": " jobs", "avg_logprob": -0.6931, "no_speech_prob": 0.0}
            ]}"#,
        );
        let confidence = WhisperStt::confidence(&response);
        assert!((confidence - 0.75).abs() < 0.01);
    }

    #[test]
    fn test_empty_text_has_zero_confidence() {
        let response = parse(r#"{"text": "  "}"#);
        assert_eq!(WhisperStt::confidence(&response), 0.0);
    }

    #[test]
    fn test_plain_json_response() {
        let response = parse(r#"{"text": "create job"}"#);
        assert_eq!(WhisperStt::confidence(&response), 1.0);
    }
}
