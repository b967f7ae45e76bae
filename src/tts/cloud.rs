//! OpenAI-compatible speech synthesis (network)

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{AudioPayload, TtsProvider};
use crate::error::ProviderError;

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

pub struct CloudTts {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl CloudTts {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl TtsProvider for CloudTts {
    fn name(&self) -> &str {
        "cloud-tts"
    }

    async fn synthesize(&self, text: &str, voice: &str) -> Result<AudioPayload, ProviderError> {
        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice,
            response_format: "wav",
        };

        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("❌ Speech API error ({}): {}", status, body);
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => ProviderError::QuotaExceeded(body),
                s if s.is_server_error() => ProviderError::Unavailable(format!("{}: {}", s, body)),
                s => ProviderError::Network(format!("{}: {}", s, body)),
            });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(ProviderError::Malformed("empty audio body".into()));
        }
        debug!("Cloud TTS returned {} bytes for '{}'", bytes.len(), text);
        Ok(AudioPayload::wav(bytes.to_vec()))
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

    #[test]
    fn test_request_shape() {
        let request = SpeechRequest {
            model: "tts-1",
            input: "Done.",
            voice: "alloy",
            response_format: "wav",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["input"], "Done.");
        assert_eq!(json["response_format"], "wav");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_network_error() {
        let tts = CloudTts::new("http://127.0.0.1:9", "key", "tts-1");
        let err = tts.synthesize("Done.", "alloy").await.unwrap_err();
        assert!(matches!(err, ProviderError::Network(_) | ProviderError::Timeout(_)));
        assert!(!tts.health_check().await);
    }
}
