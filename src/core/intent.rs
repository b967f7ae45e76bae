//! Resolved intents

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Closed set of things a voice command can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Navigate,
    CreateRecord,
    AddEntry,
    SetActiveContext,
    Query,
    Unknown,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::Navigate,
        Action::CreateRecord,
        Action::AddEntry,
        Action::SetActiveContext,
        Action::Query,
        Action::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Navigate => "navigate",
            Action::CreateRecord => "create_record",
            Action::AddEntry => "add_entry",
            Action::SetActiveContext => "set_active_context",
            Action::Query => "query",
            Action::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    /// Accepts `create_record`, `CreateRecord` and `create-record`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        Action::ALL
            .into_iter()
            .find(|a| a.as_str().replace('_', "") == key)
            .ok_or_else(|| format!("unknown action '{}'", s))
    }
}

/// Which resolver produced an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSource {
    CloudReasoning,
    OfflinePattern,
}

/// Structured meaning of a final transcript. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub action: Action,
    pub entities: BTreeMap<String, String>,
    pub confidence: f32,
    pub source: IntentSource,
    /// Natural-language reply to speak
    pub raw_response_text: String,
}

impl Intent {
    /// The deliberate "could not tell" result
    pub fn unknown(source: IntentSource) -> Self {
        Self {
            action: Action::Unknown,
            entities: BTreeMap::new(),
            confidence: 0.0,
            source,
            raw_response_text: String::new(),
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.action != Action::Unknown
    }

    pub fn entity(&self, slot: &str) -> Option<&str> {
        self.entities.get(slot).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parse_variants() {
        assert_eq!("create_record".parse::<Action>().unwrap(), Action::CreateRecord);
        assert_eq!("CreateRecord".parse::<Action>().unwrap(), Action::CreateRecord);
        assert_eq!("set-active-context".parse::<Action>().unwrap(), Action::SetActiveContext);
        assert!("delete_everything".parse::<Action>().is_err());
    }

    #[test]
    fn test_unknown_is_not_actionable() {
        let intent = Intent::unknown(IntentSource::OfflinePattern);
        assert!(!intent.is_actionable());
        assert_eq!(intent.confidence, 0.0);
    }
}
