//! Periodic provider health checks
//!
//! Runs off the pipeline's path: checks update descriptor state and then
//! ask the mode controller to re-evaluate.

use futures::future::join_all;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ProviderCatalog, ProviderRegistry, Role};
use crate::config::RecoveryConfig;
use crate::mode::ModeController;

pub struct HealthMonitor {
    registry: Arc<ProviderRegistry>,
    catalog: Arc<ProviderCatalog>,
    mode: Arc<ModeController>,
    interval: Duration,
    timeouts: RoleTimeouts,
}

#[derive(Debug, Clone, Copy)]
struct RoleTimeouts {
    stt: Duration,
    intent: Duration,
    tts: Duration,
}

type Check = Pin<Box<dyn Future<Output = (Role, String, bool)> + Send>>;

fn check(
    role: Role,
    name: String,
    timeout: Duration,
    probe: impl Future<Output = bool> + Send + 'static,
) -> Check {
    Box::pin(async move {
        let healthy = tokio::time::timeout(timeout, probe).await.unwrap_or(false);
        (role, name, healthy)
    })
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        catalog: Arc<ProviderCatalog>,
        mode: Arc<ModeController>,
        interval: Duration,
    ) -> Self {
        let default = Duration::from_secs(5);
        Self {
            registry,
            catalog,
            mode,
            interval,
            timeouts: RoleTimeouts {
                stt: default,
                intent: default,
                tts: default,
            },
        }
    }

    /// Bound each check by its role's call timeout
    pub fn with_timeouts(mut self, recovery: &RecoveryConfig) -> Self {
        self.timeouts = RoleTimeouts {
            stt: Duration::from_millis(recovery.stt_timeout_ms),
            intent: Duration::from_millis(recovery.intent_timeout_ms),
            tts: Duration::from_millis(recovery.tts_timeout_ms),
        };
        self
    }

    /// Check every provider once, concurrently
    pub async fn check_all(&self) {
        let mut checks: Vec<Check> = Vec::new();

        for (name, provider) in self.catalog.stt.iter() {
            let provider = provider.clone();
            checks.push(check(Role::Stt, name.clone(), self.timeouts.stt, async move {
                provider.health_check().await
            }));
        }
        for (name, provider) in self.catalog.intent.iter() {
            let provider = provider.clone();
            checks.push(check(Role::Intent, name.clone(), self.timeouts.intent, async move {
                provider.health_check().await
            }));
        }
        for (name, provider) in self.catalog.tts.iter() {
            let provider = provider.clone();
            checks.push(check(Role::Tts, name.clone(), self.timeouts.tts, async move {
                provider.health_check().await
            }));
        }

        for (role, name, healthy) in join_all(checks).await {
            debug!("Health check {}/{}: {}", role, name, healthy);
            self.registry.record_health_check(role, &name, healthy);
        }
        self.mode.evaluate_now();
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("🩺 Health monitor started (every {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.check_all().await,
            }
        }
        debug!("Health monitor stopped");
    }
}
