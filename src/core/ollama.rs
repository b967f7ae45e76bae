//! Ollama AI Integration
//!
//! Cloud reasoning provider. Routes transcripts through an Ollama LLM and
//! validates the reply against a strict schema; nothing is partially trusted.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

use super::{Action, Intent, IntentSource, ReasoningProvider, ReasoningRequest};
use crate::error::ProviderError;

/// Ollama API response
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

/// Exact shape the model must return
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParsedIntent {
    action: String,
    #[serde(default)]
    entities: HashMap<String, serde_json::Value>,
    confidence: f32,
    response: String,
}

/// Handles Ollama LLM integration for intent extraction
#[derive(Clone)]
pub struct OllamaReasoner {
    client: Client,
    url: String,
    model: String,
}

impl OllamaReasoner {
    pub fn new(url: &str, model: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    fn build_prompt(&self, request: &ReasoningRequest) -> String {
        let context = &request.context;
        let mut context_hint = String::new();
        if let Some(record) = &context.active_record_id {
            context_hint.push_str(&format!("- Active record: {record}\n"));
        }
        if let Some(view) = &context.current_view {
            context_hint.push_str(&format!("- Current view: {view}\n"));
        }
        if !context.recent_action_history.is_empty() {
            context_hint.push_str(&format!(
                "- Recent actions: {}\n",
                context.recent_action_history.join(", ")
            ));
        }
        let transcript = &request.transcript;
        let language = &request.language;

        format!(
            r#"You are the voice command parser of a field-service app. Extract the intent from this command and respond with ONLY valid JSON.
Language: {language}
Context:
{context_hint}
Command: "{transcript}"

Respond with JSON in this exact format:
{{"action": "action_name", "entities": {{"slot": "value"}}, "confidence": 0.9, "response": "short reply to speak"}}

Valid actions:
- navigate: Open a view. Entities: view
- create_record: Create a job, customer, invoice, quote or note. Entities: kind, title
- add_entry: Log hours, materials, mileage or a note. Entities: quantity, unit, target (optional), text (notes)
- set_active_context: Switch the active record. Entities: record
- query: Ask a question about the data. Entities: query
- unknown: Cannot determine intent

JSON response:"#
        )
    }

    /// Validate the model's JSON. Any deviation is `Malformed`.
    fn parse_intent_response(response: &str) -> Result<Intent, ProviderError> {
        // Ollama may wrap the object in extra text
        let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) else {
            return Err(ProviderError::Malformed(format!(
                "no JSON object in reply: {}",
                response
            )));
        };
        if end < start {
            return Err(ProviderError::Malformed("unbalanced JSON".into()));
        }

        let parsed: ParsedIntent = serde_json::from_str(&response[start..=end])
            .map_err(|e| ProviderError::Malformed(format!("schema violation: {}", e)))?;

        let action: Action = parsed.action.parse().map_err(ProviderError::Malformed)?;

        if !(0.0..=1.0).contains(&parsed.confidence) || parsed.confidence.is_nan() {
            return Err(ProviderError::Malformed(format!(
                "confidence {} out of range",
                parsed.confidence
            )));
        }

        let mut entities = BTreeMap::new();
        for (slot, value) in parsed.entities {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Null => continue,
                other => {
                    return Err(ProviderError::Malformed(format!(
                        "entity '{}' is not a scalar: {}",
                        slot, other
                    )))
                }
            };
            entities.insert(slot, value);
        }

        if action != Action::Unknown && parsed.response.trim().is_empty() {
            return Err(ProviderError::Malformed("missing response text".into()));
        }

        Ok(Intent {
            action,
            entities,
            confidence: if action == Action::Unknown {
                0.0
            } else {
                parsed.confidence
            },
            source: IntentSource::CloudReasoning,
            raw_response_text: parsed.response.trim().to_string(),
        })
    }
}

#[async_trait]
impl ReasoningProvider for OllamaReasoner {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn reason(&self, request: &ReasoningRequest) -> Result<Intent, ProviderError> {
        let prompt = self.build_prompt(request);

        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&serde_json::json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
                "format": "json",
                "options": {
                    "temperature": 0.1,
                    "num_predict": 200
                }
            }))
            .send()
            .await?;

        let status = response.status();
        let body_text = response.text().await?;

        if !status.is_success() {
            warn!("❌ Ollama API Error ({}): {}", status, body_text);
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => ProviderError::QuotaExceeded(body_text),
                s if s.is_server_error() => ProviderError::Unavailable(format!("{}", s)),
                s => ProviderError::Network(format!("{}: {}", s, body_text)),
            });
        }

        debug!("🧠 Ollama raw body: {}", body_text);

        let ollama_resp: OllamaResponse = serde_json::from_str(&body_text).map_err(|e| {
            ProviderError::Malformed(format!("failed to deserialize Ollama response: {}", e))
        })?;

        Self::parse_intent_response(&ollama_resp.response)
    }

    /// Health check - verify Ollama is reachable
    async fn health_check(&self) -> bool {
        match self
            .client
            .get(format!("{}/api/tags", self.url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ContextSnapshot;

    #[test]
    fn test_parse_valid_reply() {
        let reply = r#"Sure! {"action": "create_record", "entities": {"kind": "job", "title": "Roof Repair"}, "confidence": 0.92, "response": "Creating job Roof Repair."}"#;
        let intent = OllamaReasoner::parse_intent_response(reply).unwrap();
        assert_eq!(intent.action, Action::CreateRecord);
        assert_eq!(intent.entity("title"), Some("Roof Repair"));
        assert_eq!(intent.source, IntentSource::CloudReasoning);
        assert_eq!(intent.raw_response_text, "Creating job Roof Repair.");
    }

    #[test]
    fn test_numeric_entities_become_strings() {
        let reply = r#"{"action": "add_entry", "entities": {"quantity": 2, "unit": "hours"}, "confidence": 0.8, "response": "Added 2 hours."}"#;
        let intent = OllamaReasoner::parse_intent_response(reply).unwrap();
        assert_eq!(intent.entity("quantity"), Some("2"));
    }

    #[test]
    fn test_schema_violations_are_malformed() {
        let cases = [
            "I could not understand that",
            r#"{"action": "launch_rockets", "entities": {}, "confidence": 0.9, "response": "ok"}"#,
            r#"{"action": "navigate", "entities": {"view": "jobs"}, "confidence": 1.7, "response": "ok"}"#,
            r#"{"action": "navigate", "entities": {"view": ["jobs"]}, "confidence": 0.9, "response": "ok"}"#,
            r#"{"action": "navigate", "entities": {}, "confidence": 0.9, "response": "ok", "extra": 1}"#,
            r#"{"action": "navigate", "entities": {"view": "jobs"}, "confidence": 0.9, "response": ""}"#,
            r#"{"action": "navigate", "confidence": 0.9}"#,
        ];
        for reply in cases {
            let result = OllamaReasoner::parse_intent_response(reply);
            assert!(
                matches!(result, Err(ProviderError::Malformed(_))),
                "accepted: {}",
                reply
            );
        }
    }

    #[test]
    fn test_prompt_carries_context() {
        let reasoner = OllamaReasoner::new("http://localhost:11434/", "llama3");
        let request = ReasoningRequest {
            transcript: "add two hours".into(),
            context: ContextSnapshot {
                active_record_id: Some("job-42".into()),
                current_view: Some("jobs".into()),
                recent_action_history: vec!["navigate".into()],
            },
            language: "en".into(),
        };
        let prompt = reasoner.build_prompt(&request);
        assert!(prompt.contains("Active record: job-42"));
        assert!(prompt.contains("\"add two hours\""));
        assert_eq!(reasoner.url, "http://localhost:11434");
    }
}
