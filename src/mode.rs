//! Mode / Degradation Controller
//!
//! Computes the single [`DegradationLevel`] every stage reads at the start
//! of its turn. The level is a pure function of connectivity and registry
//! state, published as a versioned [`ModeSnapshot`] over a watch channel.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ModeConfig;
use crate::providers::{ProviderRegistry, Role, Tier};

/// Ceiling on which provider tiers may be used. Ordered by restriction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    Full,
    Partial,
    Basic,
    Disabled,
}

impl DegradationLevel {
    /// Tiers a role may use at this level
    pub fn allowed_tiers(self, role: Role) -> &'static [Tier] {
        match (self, role) {
            (DegradationLevel::Full, _) => &[Tier::Network, Tier::Local],
            (DegradationLevel::Partial, Role::Stt) => &[Tier::Network, Tier::Local],
            (DegradationLevel::Partial, _) => &[Tier::Local],
            (DegradationLevel::Basic, _) => &[Tier::Local],
            (DegradationLevel::Disabled, _) => &[],
        }
    }

    pub fn permits(self, role: Role, tier: Tier) -> bool {
        self.allowed_tiers(role).contains(&tier)
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DegradationLevel::Full => "full",
            DegradationLevel::Partial => "partial",
            DegradationLevel::Basic => "basic",
            DegradationLevel::Disabled => "disabled",
        };
        write!(f, "{}", name)
    }
}

/// Derive the level from connectivity and the registry's view of health
pub fn compute_level(online: bool, registry: &ProviderRegistry) -> DegradationLevel {
    let local_stt = registry.has_viable(Role::Stt, Tier::Local);

    if !online {
        return if local_stt {
            DegradationLevel::Basic
        } else {
            DegradationLevel::Disabled
        };
    }

    let network_stt = registry.has_viable(Role::Stt, Tier::Network);
    let network_intent = registry.has_viable(Role::Intent, Tier::Network);
    let network_tts = registry.has_viable(Role::Tts, Tier::Network);

    if network_stt && network_intent && network_tts {
        DegradationLevel::Full
    } else if network_stt {
        DegradationLevel::Partial
    } else if local_stt {
        DegradationLevel::Basic
    } else {
        DegradationLevel::Disabled
    }
}

/// Published level, bumped on every change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSnapshot {
    pub level: DegradationLevel,
    pub online: bool,
    pub version: u64,
}

/// Online/offline signal with change notification
#[derive(Debug)]
pub struct Connectivity {
    tx: watch::Sender<bool>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(
                "{} Connectivity changed: {}",
                if online { "📶" } else { "📴" },
                if online { "online" } else { "offline" }
            );
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Periodically probe `url` and feed the result into the signal
    pub fn spawn_probe(
        self: Arc<Self>,
        url: String,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reachable = client
                            .head(&url)
                            .timeout(Duration::from_secs(3))
                            .send()
                            .await
                            .is_ok();
                        debug!("Connectivity probe {}: {}", url, reachable);
                        self.set_online(reachable);
                    }
                }
            }
        })
    }
}

/// Owns and publishes the authoritative degradation level
pub struct ModeController {
    registry: Arc<ProviderRegistry>,
    connectivity: Arc<Connectivity>,
    tx: watch::Sender<ModeSnapshot>,
    interval: Duration,
}

impl ModeController {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        connectivity: Arc<Connectivity>,
        config: &ModeConfig,
    ) -> Self {
        let online = connectivity.is_online();
        let level = compute_level(online, &registry);
        info!("🎚️ Initial degradation level: {}", level);
        let (tx, _rx) = watch::channel(ModeSnapshot {
            level,
            online,
            version: 0,
        });
        Self {
            registry,
            connectivity,
            tx,
            interval: config.evaluation_interval(),
        }
    }

    pub fn current(&self) -> ModeSnapshot {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ModeSnapshot> {
        self.tx.subscribe()
    }

    pub fn connectivity(&self) -> &Arc<Connectivity> {
        &self.connectivity
    }

    /// Recompute now and publish if anything changed
    pub fn evaluate_now(&self) -> ModeSnapshot {
        let online = self.connectivity.is_online();
        let level = compute_level(online, &self.registry);
        self.tx.send_if_modified(|snapshot| {
            if snapshot.level == level && snapshot.online == online {
                return false;
            }
            info!("🎚️ Degradation level {} -> {}", snapshot.level, level);
            snapshot.level = level;
            snapshot.online = online;
            snapshot.version += 1;
            true
        });
        self.current()
    }

    /// A role ran out of providers; demote if the registry says so
    pub fn notify_unavailable(&self, role: Role) -> ModeSnapshot {
        warn!("⚠️ No {} provider left, re-evaluating mode", role);
        self.evaluate_now()
    }

    /// Re-evaluate on the timer and on every connectivity change
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut connectivity = self.connectivity.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        // First tick fires immediately; also catches changes made before we subscribed
        ticker.tick().await;
        self.evaluate_now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.evaluate_now();
                }
                _ = ticker.tick() => {
                    self.evaluate_now();
                }
            }
        }
        debug!("Mode controller stopped");
    }
}
