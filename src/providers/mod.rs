//! Provider Registry & Selector
//!
//! Keeps one [`ProviderDescriptor`] per registered STT / reasoning / TTS
//! implementation and picks the best viable one for a role. The registry
//! only holds descriptors; the implementations live in a [`ProviderCatalog`]
//! keyed by the same names.

pub mod health;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::asr::SttProvider;
use crate::config::RegistryConfig;
use crate::core::ReasoningProvider;
use crate::tts::TtsProvider;

pub use health::HealthMonitor;

/// Capability a provider implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Stt,
    Intent,
    Tts,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Stt => write!(f, "stt"),
            Role::Intent => write!(f, "intent"),
            Role::Tts => write!(f, "tts"),
        }
    }
}

/// Where a provider runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Network,
    Local,
}

/// Outcome of the latest health check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthCheck {
    pub at: Instant,
    pub healthy: bool,
}

/// One implementation of a role
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub role: Role,
    pub name: String,
    /// Lower is preferred
    pub priority: u32,
    pub tier: Tier,
    pub last_health_check: Option<HealthCheck>,
    /// Most recent successful health check or call
    pub last_success: Option<Instant>,
    pub consecutive_failures: u32,
    recent_failures: VecDeque<Instant>,
    registration_order: usize,
}

impl ProviderDescriptor {
    pub fn new(role: Role, name: impl Into<String>, priority: u32, tier: Tier) -> Self {
        Self {
            role,
            name: name.into(),
            priority,
            tier,
            last_health_check: None,
            last_success: None,
            consecutive_failures: 0,
            recent_failures: VecDeque::new(),
            registration_order: 0,
        }
    }

    /// Failures recorded inside the rolling window ending at `now`
    pub fn failures_within(&self, window: Duration, now: Instant) -> usize {
        self.recent_failures
            .iter()
            .filter(|&&at| now.saturating_duration_since(at) <= window)
            .count()
    }

    pub fn registration_order(&self) -> usize {
        self.registration_order
    }
}

/// `select()` found nothing; callers fall back, they do not retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no viable {role} provider")]
pub struct NotAvailable {
    pub role: Role,
}

#[derive(Debug, Default)]
struct RegistryState {
    descriptors: Vec<ProviderDescriptor>,
    next_order: usize,
}

/// Tracks provider health and ranks providers per role
#[derive(Debug)]
pub struct ProviderRegistry {
    state: Mutex<RegistryState>,
    trip_threshold: u32,
    failure_window: Duration,
}

impl ProviderRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            trip_threshold: config.trip_threshold,
            failure_window: config.failure_window(),
        }
    }

    // Updates are counter bumps and timestamp overwrites, so a poisoned
    // lock still holds consistent data.
    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a provider. Re-registering a name updates its ranking.
    pub fn register(&self, mut descriptor: ProviderDescriptor) {
        let mut state = self.state();
        if let Some(existing) = state
            .descriptors
            .iter_mut()
            .find(|d| d.role == descriptor.role && d.name == descriptor.name)
        {
            warn!(
                "⚠️ Provider {}/{} registered twice, updating ranking",
                descriptor.role, descriptor.name
            );
            existing.priority = descriptor.priority;
            existing.tier = descriptor.tier;
            return;
        }

        descriptor.registration_order = state.next_order;
        state.next_order += 1;
        info!(
            "📇 Registered {} provider '{}' (priority {}, {:?})",
            descriptor.role, descriptor.name, descriptor.priority, descriptor.tier
        );
        state.descriptors.push(descriptor);
    }

    /// Record a passing health check or a successful call
    pub fn mark_healthy(&self, role: Role, name: &str) {
        let now = Instant::now();
        let mut state = self.state();
        if let Some(d) = find_mut(&mut state, role, name) {
            d.last_health_check = Some(HealthCheck { at: now, healthy: true });
            d.last_success = Some(now);
            d.consecutive_failures = 0;
            d.recent_failures.clear();
        }
    }

    /// Record a failed call or health check
    pub fn mark_failed(&self, role: Role, name: &str) {
        let now = Instant::now();
        let window = self.failure_window;
        let mut state = self.state();
        if let Some(d) = find_mut(&mut state, role, name) {
            d.consecutive_failures = d.consecutive_failures.saturating_add(1);
            d.recent_failures.push_back(now);
            while let Some(&oldest) = d.recent_failures.front() {
                if now.saturating_duration_since(oldest) > window {
                    d.recent_failures.pop_front();
                } else {
                    break;
                }
            }
            debug!(
                "Provider {}/{} failure #{}",
                role, name, d.consecutive_failures
            );
        }
    }

    /// Apply a scheduled health check result
    pub fn record_health_check(&self, role: Role, name: &str, healthy: bool) {
        if healthy {
            self.mark_healthy(role, name);
            return;
        }
        self.mark_failed(role, name);
        let mut state = self.state();
        if let Some(d) = find_mut(&mut state, role, name) {
            d.last_health_check = Some(HealthCheck {
                at: Instant::now(),
                healthy: false,
            });
        }
    }

    /// Best viable provider for `role` among `allowed` tiers
    pub fn select(&self, role: Role, allowed: &[Tier]) -> Result<ProviderDescriptor, NotAvailable> {
        self.select_excluding(role, allowed, &[])
    }

    /// Like [`select`](Self::select), skipping providers already tried this turn
    pub fn select_excluding(
        &self,
        role: Role,
        allowed: &[Tier],
        exclude: &[String],
    ) -> Result<ProviderDescriptor, NotAvailable> {
        let now = Instant::now();
        let state = self.state();
        state
            .descriptors
            .iter()
            .filter(|d| d.role == role)
            .filter(|d| allowed.contains(&d.tier))
            .filter(|d| !exclude.iter().any(|n| n == &d.name))
            .filter(|d| self.is_viable(d, now))
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    // Option<Instant> orders None first; reverse so the most
                    // recent success wins
                    .then_with(|| b.last_success.cmp(&a.last_success))
                    .then_with(|| a.registration_order.cmp(&b.registration_order))
            })
            .cloned()
            .ok_or(NotAvailable { role })
    }

    /// Whether any provider of `role` in `tier` is currently viable
    pub fn has_viable(&self, role: Role, tier: Tier) -> bool {
        self.select(role, &[tier]).is_ok()
    }

    pub fn is_viable(&self, descriptor: &ProviderDescriptor, now: Instant) -> bool {
        (descriptor.failures_within(self.failure_window, now) as u32) < self.trip_threshold
    }

    pub fn get(&self, role: Role, name: &str) -> Option<ProviderDescriptor> {
        self.state()
            .descriptors
            .iter()
            .find(|d| d.role == role && d.name == name)
            .cloned()
    }

    /// Snapshot of every descriptor, in registration order
    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.state().descriptors.clone()
    }
}

fn find_mut<'a>(
    state: &'a mut RegistryState,
    role: Role,
    name: &str,
) -> Option<&'a mut ProviderDescriptor> {
    let found = state
        .descriptors
        .iter_mut()
        .find(|d| d.role == role && d.name == name);
    if found.is_none() {
        warn!("⚠️ Health update for unknown provider {}/{}", role, name);
    }
    found
}

/// Provider implementations for one role, keyed by descriptor name
pub struct ProviderSet<P: ?Sized> {
    providers: HashMap<String, Arc<P>>,
}

impl<P: ?Sized> Default for ProviderSet<P> {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }
}

impl<P: ?Sized> ProviderSet<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, provider: Arc<P>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<P>> {
        self.providers.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<P>)> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Every provider implementation known to the pipeline
#[derive(Default)]
pub struct ProviderCatalog {
    pub stt: ProviderSet<dyn SttProvider>,
    pub intent: ProviderSet<dyn ReasoningProvider>,
    pub tts: ProviderSet<dyn TtsProvider>,
}

impl ProviderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an STT provider with the registry and keep its implementation
    pub fn add_stt(
        &mut self,
        registry: &ProviderRegistry,
        priority: u32,
        tier: Tier,
        provider: Arc<dyn SttProvider>,
    ) {
        let name = provider.name().to_string();
        registry.register(ProviderDescriptor::new(Role::Stt, name.clone(), priority, tier));
        self.stt.insert(name, provider);
    }

    pub fn add_reasoner(
        &mut self,
        registry: &ProviderRegistry,
        priority: u32,
        tier: Tier,
        provider: Arc<dyn ReasoningProvider>,
    ) {
        let name = provider.name().to_string();
        registry.register(ProviderDescriptor::new(Role::Intent, name.clone(), priority, tier));
        self.intent.insert(name, provider);
    }

    pub fn add_tts(
        &mut self,
        registry: &ProviderRegistry,
        priority: u32,
        tier: Tier,
        provider: Arc<dyn TtsProvider>,
    ) {
        let name = provider.name().to_string();
        registry.register(ProviderDescriptor::new(Role::Tts, name.clone(), priority, tier));
        self.tts.insert(name, provider);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(&RegistryConfig::default())
    }

    #[test]
    fn test_select_lowest_priority() {
        let reg = registry();
        reg.register(ProviderDescriptor::new(Role::Stt, "b", 2, Tier::Network));
        reg.register(ProviderDescriptor::new(Role::Stt, "a", 1, Tier::Network));
        reg.register(ProviderDescriptor::new(Role::Tts, "t", 0, Tier::Network));

        let picked = reg.select(Role::Stt, &[Tier::Network]).unwrap();
        assert_eq!(picked.name, "a");
    }

    #[test]
    fn test_select_respects_tiers() {
        let reg = registry();
        reg.register(ProviderDescriptor::new(Role::Stt, "cloud", 1, Tier::Network));
        reg.register(ProviderDescriptor::new(Role::Stt, "local", 5, Tier::Local));

        assert_eq!(reg.select(Role::Stt, &[Tier::Local]).unwrap().name, "local");
        assert_eq!(
            reg.select(Role::Intent, &[Tier::Local, Tier::Network]).unwrap_err(),
            NotAvailable { role: Role::Intent }
        );
        assert!(reg.select(Role::Stt, &[]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trip_threshold_and_window() {
        let reg = registry();
        reg.register(ProviderDescriptor::new(Role::Tts, "a", 1, Tier::Network));
        reg.register(ProviderDescriptor::new(Role::Tts, "b", 2, Tier::Network));

        reg.mark_failed(Role::Tts, "a");
        reg.mark_failed(Role::Tts, "a");
        assert_eq!(reg.select(Role::Tts, &[Tier::Network]).unwrap().name, "a");

        reg.mark_failed(Role::Tts, "a");
        assert_eq!(reg.select(Role::Tts, &[Tier::Network]).unwrap().name, "b");

        // Failures age out of the rolling window
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(reg.select(Role::Tts, &[Tier::Network]).unwrap().name, "a");
    }

    #[test]
    fn test_mark_healthy_resets_failures() {
        let reg = registry();
        reg.register(ProviderDescriptor::new(Role::Stt, "a", 1, Tier::Local));
        for _ in 0..3 {
            reg.mark_failed(Role::Stt, "a");
        }
        assert!(!reg.has_viable(Role::Stt, Tier::Local));
        assert_eq!(reg.get(Role::Stt, "a").unwrap().consecutive_failures, 3);

        reg.mark_healthy(Role::Stt, "a");
        assert!(reg.has_viable(Role::Stt, Tier::Local));
        assert_eq!(reg.get(Role::Stt, "a").unwrap().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tie_break_by_recent_health_then_registration() {
        let reg = registry();
        reg.register(ProviderDescriptor::new(Role::Stt, "first", 1, Tier::Local));
        reg.register(ProviderDescriptor::new(Role::Stt, "second", 1, Tier::Local));

        // Equal priority, no health history: registration order
        assert_eq!(reg.select(Role::Stt, &[Tier::Local]).unwrap().name, "first");

        reg.mark_healthy(Role::Stt, "first");
        tokio::time::advance(Duration::from_secs(1)).await;
        reg.mark_healthy(Role::Stt, "second");
        assert_eq!(reg.select(Role::Stt, &[Tier::Local]).unwrap().name, "second");
    }

    #[test]
    fn test_select_excluding() {
        let reg = registry();
        reg.register(ProviderDescriptor::new(Role::Stt, "a", 1, Tier::Local));
        reg.register(ProviderDescriptor::new(Role::Stt, "b", 2, Tier::Local));
        let picked = reg
            .select_excluding(Role::Stt, &[Tier::Local], &["a".to_string()])
            .unwrap();
        assert_eq!(picked.name, "b");
    }

    #[test]
    fn test_failed_health_check_recorded() {
        let reg = registry();
        reg.register(ProviderDescriptor::new(Role::Tts, "piper", 1, Tier::Local));
        reg.record_health_check(Role::Tts, "piper", false);
        let d = reg.get(Role::Tts, "piper").unwrap();
        assert_eq!(d.consecutive_failures, 1);
        assert!(!d.last_health_check.unwrap().healthy);
    }

    #[test]
    fn test_reregister_updates_priority() {
        let reg = registry();
        reg.register(ProviderDescriptor::new(Role::Stt, "a", 5, Tier::Local));
        reg.register(ProviderDescriptor::new(Role::Stt, "a", 1, Tier::Network));
        let descriptors = reg.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].priority, 1);
        assert_eq!(descriptors[0].tier, Tier::Network);
    }
}
