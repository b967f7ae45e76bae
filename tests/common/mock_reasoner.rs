//! Mock reasoning provider

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use fieldvoice::core::{Intent, ReasoningProvider, ReasoningRequest};
use fieldvoice::error::ProviderError;

pub struct MockReasoner {
    name: String,
    result: Mutex<Result<Intent, ProviderError>>,
    /// Never answers; the recovery timeout has to fire
    hang: bool,
    calls: AtomicUsize,
    pub requests: Mutex<Vec<ReasoningRequest>>,
}

impl MockReasoner {
    pub fn answering(name: &str, intent: Intent) -> Self {
        Self {
            name: name.to_string(),
            result: Mutex::new(Ok(intent)),
            hang: false,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn hanging(name: &str) -> Self {
        Self {
            name: name.to_string(),
            result: Mutex::new(Err(ProviderError::Timeout(0))),
            hang: true,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningProvider for MockReasoner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reason(&self, request: &ReasoningRequest) -> Result<Intent, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.result.lock().unwrap().clone()
    }
}
