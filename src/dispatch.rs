//! Action Dispatch
//!
//! Hands resolved intents to the application's [`ActionExecutor`] and maps
//! stage failures onto the recovery the user is offered.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::{Action, Intent};
use crate::error::FailureReason;

pub const REPEAT_PROMPT: &str = "Sorry, I didn't catch that. Please say it again.";
pub const CLARIFICATION_PROMPT: &str =
    "Sorry, I didn't understand. Try \"create job\", \"add two hours\" or \"open schedule\".";
pub const TEXT_INPUT_PROMPT: &str = "Voice commands aren't available right now. Please type your command.";
pub const DONE_PHRASE: &str = "Done.";

/// Example commands offered when a command was not understood
pub const SUGGESTED_COMMANDS: [&str; 5] = [
    "create job called <name>",
    "add <number> hours",
    "open <view>",
    "switch to job <number>",
    "add a note <text>",
];

/// Read-only view of application state handed to reasoning and executors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub active_record_id: Option<String>,
    pub current_view: Option<String>,
    pub recent_action_history: Vec<String>,
}

/// Supplies the current context on demand; no side effects
pub trait ContextProvider: Send + Sync {
    fn snapshot(&self) -> ContextSnapshot;
}

/// Result reported by the application for one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub detail: String,
}

impl ActionOutcome {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
        }
    }
}

/// Performs actions in the host application
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        action: Action,
        entities: &BTreeMap<String, String>,
        context: &ContextSnapshot,
    ) -> ActionOutcome;
}

/// What the user is offered after a failed or unclear turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRecovery {
    RepeatPrompt,
    TextInputFallback,
    SuggestCommands,
}

impl UserRecovery {
    /// `None` for cancellations, which end silently
    pub fn for_failure(reason: FailureReason) -> Option<Self> {
        match reason {
            FailureReason::LowConfidence | FailureReason::ProviderTransientError => {
                Some(UserRecovery::RepeatPrompt)
            }
            FailureReason::NoProviderAvailable | FailureReason::DeviceUnavailable => {
                Some(UserRecovery::TextInputFallback)
            }
            FailureReason::InvalidReasoningOutput => Some(UserRecovery::SuggestCommands),
            FailureReason::UserCancelled => None,
        }
    }

    pub fn prompt(self) -> &'static str {
        match self {
            UserRecovery::RepeatPrompt => REPEAT_PROMPT,
            UserRecovery::TextInputFallback => TEXT_INPUT_PROMPT,
            UserRecovery::SuggestCommands => CLARIFICATION_PROMPT,
        }
    }
}

/// Outcome of dispatching one intent
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub outcome: Option<ActionOutcome>,
    pub response_text: String,
    pub recovery: Option<UserRecovery>,
}

pub struct ActionDispatcher {
    executor: Arc<dyn ActionExecutor>,
}

impl ActionDispatcher {
    pub fn new(executor: Arc<dyn ActionExecutor>) -> Self {
        Self { executor }
    }

    /// Execute an actionable intent. `Unknown` never reaches the executor.
    pub async fn dispatch(&self, intent: &Intent, context: &ContextSnapshot) -> Dispatched {
        if !intent.is_actionable() {
            info!("❓ Unknown intent, asking for clarification");
            return Dispatched {
                outcome: None,
                response_text: CLARIFICATION_PROMPT.to_string(),
                recovery: Some(UserRecovery::SuggestCommands),
            };
        }

        let outcome = self
            .executor
            .execute(intent.action, &intent.entities, context)
            .await;

        let response_text = if outcome.success {
            info!("✅ {} succeeded: {}", intent.action, outcome.detail);
            if intent.raw_response_text.trim().is_empty() {
                DONE_PHRASE.to_string()
            } else {
                intent.raw_response_text.clone()
            }
        } else {
            // Executor failures are reported, not retried
            warn!("❌ {} failed: {}", intent.action, outcome.detail);
            format!("That didn't work: {}", outcome.detail)
        };

        Dispatched {
            outcome: Some(outcome),
            response_text,
            recovery: None,
        }
    }
}
