//! FieldVoice Error Types
//!
//! Three layers of failure:
//! - [`VoiceError`]: setup and runtime errors of the crate itself
//! - [`ProviderError`]: what a single STT / reasoning / TTS call can return
//! - [`FailureReason`]: the terminal reason a pipeline stage gives up on a turn

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Central error type for FieldVoice
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider setup error: {0}")]
    Provider(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Lock poisoned: {0}")]
    Lock(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for FieldVoice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Helper to convert Mutex poison errors
impl<T> From<std::sync::PoisonError<T>> for VoiceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        VoiceError::Lock(err.to_string())
    }
}

/// Error returned by a single provider call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("provider timed out after {0} ms")]
    Timeout(u64),

    #[error("network error: {0}")]
    Network(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("malformed provider output: {0}")]
    Malformed(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("call cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Recovery class this error falls into
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Timeout(_)
            | ProviderError::Network(_)
            | ProviderError::QuotaExceeded(_)
            | ProviderError::Unavailable(_) => ErrorClass::Transient,
            ProviderError::Malformed(_) => ErrorClass::Malformed,
            ProviderError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(0)
        } else if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else if err.status().map(|s| s.as_u16()) == Some(429) {
            ProviderError::QuotaExceeded(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        ProviderError::Network(err.to_string())
    }
}

/// Error classes the recovery engine keeps a policy for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    LowConfidence,
    NoProvider,
    Malformed,
    Cancelled,
}

/// Terminal reason a stage failed a turn
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    #[error("audio input device unavailable")]
    DeviceUnavailable,

    #[error("recognition confidence below threshold")]
    LowConfidence,

    #[error("no provider available for role")]
    NoProviderAvailable,

    #[error("reasoning provider returned invalid output")]
    InvalidReasoningOutput,

    #[error("cancelled by user")]
    UserCancelled,

    #[error("transient provider error")]
    ProviderTransientError,
}

impl FailureReason {
    /// Whether the turn unwinds immediately, without retry or fallback
    pub fn is_immediate(self) -> bool {
        matches!(
            self,
            FailureReason::DeviceUnavailable | FailureReason::UserCancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classes() {
        assert_eq!(ProviderError::Timeout(10).class(), ErrorClass::Transient);
        assert_eq!(
            ProviderError::QuotaExceeded("429".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ProviderError::Malformed("bad json".into()).class(),
            ErrorClass::Malformed
        );
        assert_eq!(ProviderError::Cancelled.class(), ErrorClass::Cancelled);
    }

    #[test]
    fn test_immediate_reasons() {
        assert!(FailureReason::UserCancelled.is_immediate());
        assert!(FailureReason::DeviceUnavailable.is_immediate());
        assert!(!FailureReason::LowConfidence.is_immediate());
        assert!(!FailureReason::NoProviderAvailable.is_immediate());
    }

    #[test]
    fn test_failure_reason_serialization() {
        let json = serde_json::to_string(&FailureReason::LowConfidence).unwrap();
        assert_eq!(json, "\"low_confidence\"");
    }
}
