//! Error Recovery Engine
//!
//! One retry / backoff / fallback routine shared by every stage. Behaviour
//! is driven by a policy table keyed by [`ErrorClass`]; the provider chain
//! for a role comes from the registry's ranking.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::{self, Future};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{default_policies, RecoveryConfig};
use crate::error::{ErrorClass, FailureReason, ProviderError};
use crate::mode::ModeController;
use crate::providers::{ProviderRegistry, ProviderSet, Role, Tier};

/// Delay between attempts on the same provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    None,
    Immediate,
    Exponential { base_ms: u64, factor: u32 },
}

impl Backoff {
    /// Delay before retry number `retry` (0-based)
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::None | Backoff::Immediate => Duration::ZERO,
            Backoff::Exponential { base_ms, factor } => {
                let multiplier = (factor as u64).saturating_pow(retry);
                Duration::from_millis(base_ms.saturating_mul(multiplier))
            }
        }
    }
}

/// What happens once retries are spent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
    /// Try the next-ranked provider of the same role
    NextProvider,
    /// Ask the user to say it again
    PromptRepeat,
    /// Demote the degradation level and notify the controller
    DemoteMode,
    /// Unwind immediately
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    pub retries: u32,
    pub backoff: Backoff,
    pub fallback: Fallback,
}

/// A successful call and the provider that served it
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub provider: String,
    pub attempts: u32,
}

pub struct RecoveryEngine {
    registry: Arc<ProviderRegistry>,
    mode: Arc<ModeController>,
    policies: HashMap<ErrorClass, RecoveryPolicy>,
    stt_timeout: Duration,
    intent_timeout: Duration,
    tts_timeout: Duration,
    jitter_ms: u64,
}

impl RecoveryEngine {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        mode: Arc<ModeController>,
        config: &RecoveryConfig,
    ) -> Self {
        let mut policies = default_policies();
        policies.extend(config.policies.iter().map(|(k, v)| (*k, *v)));
        Self {
            registry,
            mode,
            policies,
            stt_timeout: Duration::from_millis(config.stt_timeout_ms),
            intent_timeout: Duration::from_millis(config.intent_timeout_ms),
            tts_timeout: Duration::from_millis(config.tts_timeout_ms),
            jitter_ms: config.backoff_jitter_ms,
        }
    }

    pub fn policy(&self, class: ErrorClass) -> RecoveryPolicy {
        self.policies.get(&class).copied().unwrap_or(RecoveryPolicy {
            retries: 0,
            backoff: Backoff::None,
            fallback: Fallback::Abort,
        })
    }

    pub fn timeout(&self, role: Role) -> Duration {
        match role {
            Role::Stt => self.stt_timeout,
            Role::Intent => self.intent_timeout,
            Role::Tts => self.tts_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Run `call` against the role's provider chain until one succeeds.
    ///
    /// Each attempt is bounded by the role timeout and aborted by `cancel`.
    /// Failures are reported to the registry as they happen, so the next
    /// `select` already reflects them.
    pub async fn execute<P, T, F, Fut>(
        &self,
        role: Role,
        allowed: &[Tier],
        providers: &ProviderSet<P>,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<Attempted<T>, FailureReason>
    where
        P: ?Sized,
        F: FnMut(Arc<P>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.execute_armed(role, allowed, providers, cancel, || future::ready(()), call)
            .await
    }

    /// Like [`execute`](Self::execute), but each attempt's timeout only
    /// starts once the future made by `armed` resolves. Streaming
    /// recognition arms on end of speech.
    pub async fn execute_armed<P, T, F, Fut, A, AFut>(
        &self,
        role: Role,
        allowed: &[Tier],
        providers: &ProviderSet<P>,
        cancel: &CancellationToken,
        armed: A,
        mut call: F,
    ) -> Result<Attempted<T>, FailureReason>
    where
        P: ?Sized,
        F: FnMut(Arc<P>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
        A: Fn() -> AFut,
        AFut: Future<Output = ()>,
    {
        let timeout = self.timeout(role);
        let mut tried: Vec<String> = Vec::new();
        let mut last_class: Option<ErrorClass> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(FailureReason::UserCancelled);
            }

            let descriptor = match self.registry.select_excluding(role, allowed, &tried) {
                Ok(descriptor) => descriptor,
                Err(_) => return Err(self.exhausted(role, last_class)),
            };
            tried.push(descriptor.name.clone());

            let Some(provider) = providers.get(&descriptor.name) else {
                warn!(
                    "⚠️ {} provider '{}' registered without an implementation",
                    role, descriptor.name
                );
                continue;
            };

            let mut retries_used: u32 = 0;
            let mut attempts: u32 = 0;
            loop {
                attempts += 1;
                debug!(
                    "{} attempt {} via '{}' (timeout {:?})",
                    role, attempts, descriptor.name, timeout
                );

                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ProviderError::Cancelled),
                    outcome = bounded(timeout, armed(), call(provider.clone())) => outcome,
                };

                let err = match result {
                    Ok(value) => {
                        self.registry.mark_healthy(role, &descriptor.name);
                        return Ok(Attempted {
                            value,
                            provider: descriptor.name,
                            attempts,
                        });
                    }
                    Err(err) => err,
                };

                let class = err.class();
                if class == ErrorClass::Cancelled {
                    info!("🛑 {} call to '{}' cancelled", role, descriptor.name);
                    return Err(FailureReason::UserCancelled);
                }

                self.registry.mark_failed(role, &descriptor.name);
                last_class = Some(class);

                let policy = self.policy(class);
                if policy.fallback == Fallback::Abort {
                    return Err(FailureReason::ProviderTransientError);
                }
                if retries_used >= policy.retries {
                    warn!(
                        "⚠️ {} provider '{}' gave up after {} attempt(s): {}",
                        role, descriptor.name, attempts, err
                    );
                    break;
                }

                let delay = self.backoff_delay(policy.backoff, retries_used);
                retries_used += 1;
                warn!(
                    "⚠️ {} retry {}/{} for '{}' in {:?}: {}",
                    role, retries_used, policy.retries, descriptor.name, delay, err
                );
                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(FailureReason::UserCancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn backoff_delay(&self, backoff: Backoff, retry: u32) -> Duration {
        let base = backoff.delay(retry);
        if self.jitter_ms == 0 || base.is_zero() {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter_ms))
    }

    fn exhausted(&self, role: Role, last_class: Option<ErrorClass>) -> FailureReason {
        let policy = self.policy(ErrorClass::NoProvider);
        if policy.fallback == Fallback::DemoteMode {
            self.mode.notify_unavailable(role);
        }
        match last_class {
            Some(ErrorClass::Malformed) => FailureReason::InvalidReasoningOutput,
            _ => FailureReason::NoProviderAvailable,
        }
    }
}

/// Run `attempt` with no deadline until `armed` resolves, then within `timeout`
async fn bounded<T, A, Fut>(timeout: Duration, armed: A, attempt: Fut) -> Result<T, ProviderError>
where
    A: Future<Output = ()>,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    tokio::pin!(attempt);
    tokio::select! {
        outcome = &mut attempt => return outcome,
        _ = armed => {}
    }
    tokio::time::timeout(timeout, attempt)
        .await
        .unwrap_or(Err(ProviderError::Timeout(timeout.as_millis() as u64)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModeConfig, RegistryConfig};
    use crate::mode::Connectivity;
    use crate::providers::ProviderDescriptor;
    use std::sync::Mutex;

    struct Scripted {
        name: &'static str,
        script: Mutex<Vec<Result<&'static str, ProviderError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(name: &'static str, script: Vec<Result<&'static str, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                script: Mutex::new(script),
                calls: Mutex::new(0),
            })
        }

        fn next(&self) -> Result<&'static str, ProviderError> {
            *self.calls.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(self.name)
            } else {
                script.remove(0)
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    fn engine(providers: &[(&'static str, u32)]) -> (RecoveryEngine, Arc<ProviderRegistry>) {
        let registry = Arc::new(ProviderRegistry::new(&RegistryConfig::default()));
        for (name, priority) in providers {
            registry.register(ProviderDescriptor::new(Role::Tts, *name, *priority, Tier::Network));
        }
        let mode = Arc::new(ModeController::new(
            registry.clone(),
            Arc::new(Connectivity::new(true)),
            &ModeConfig::default(),
        ));
        let engine = RecoveryEngine::new(registry.clone(), mode, &RecoveryConfig::default());
        (engine, registry)
    }

    fn set(providers: &[&Arc<Scripted>]) -> ProviderSet<Scripted> {
        let mut set = ProviderSet::new();
        for p in providers {
            set.insert(p.name, Arc::clone(p));
        }
        set
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff::Exponential {
            base_ms: 250,
            factor: 2,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(250));
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(Backoff::Immediate.delay(3), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_next_provider_after_retries() {
        let (engine, registry) = engine(&[("a", 1), ("b", 2)]);
        let a = Scripted::new(
            "a",
            vec![
                Err(ProviderError::Network("down".into())),
                Err(ProviderError::Network("down".into())),
                Err(ProviderError::Network("down".into())),
            ],
        );
        let b = Scripted::new("b", vec![]);
        let providers = set(&[&a, &b]);

        let start = tokio::time::Instant::now();
        let result = engine
            .execute(
                Role::Tts,
                &[Tier::Network],
                &providers,
                &CancellationToken::new(),
                |p| async move { p.next() },
            )
            .await
            .unwrap();

        assert_eq!(result.provider, "b");
        assert_eq!(result.value, "b");
        assert_eq!(a.calls(), 3);
        assert_eq!(b.calls(), 1);
        // 250ms + 500ms of backoff on "a"
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(750) && elapsed < Duration::from_millis(800));
        assert_eq!(registry.get(Role::Tts, "a").unwrap().consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_retried_once_then_invalid_output() {
        let (engine, _) = engine(&[("a", 1)]);
        let a = Scripted::new(
            "a",
            vec![
                Err(ProviderError::Malformed("x".into())),
                Err(ProviderError::Malformed("y".into())),
            ],
        );
        let providers = set(&[&a]);

        let err = engine
            .execute(
                Role::Tts,
                &[Tier::Network],
                &providers,
                &CancellationToken::new(),
                |p| async move { p.next() },
            )
            .await
            .unwrap_err();
        assert_eq!(err, FailureReason::InvalidReasoningOutput);
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let (engine, _) = engine(&[("slow", 1)]);
        let providers: ProviderSet<Scripted> = set(&[&Scripted::new("slow", vec![])]);

        let err = engine
            .execute(
                Role::Tts,
                &[Tier::Network],
                &providers,
                &CancellationToken::new(),
                |_p| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok("late")
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, FailureReason::NoProviderAvailable);
    }

    #[tokio::test]
    async fn test_no_provider_for_role() {
        let (engine, _) = engine(&[]);
        let providers: ProviderSet<Scripted> = ProviderSet::new();
        let err = engine
            .execute(
                Role::Tts,
                &[Tier::Network],
                &providers,
                &CancellationToken::new(),
                |p| async move { p.next() },
            )
            .await
            .unwrap_err();
        assert_eq!(err, FailureReason::NoProviderAvailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_without_retry() {
        let (engine, registry) = engine(&[("a", 1)]);
        let a = Scripted::new("a", vec![]);
        let providers = set(&[&a]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let err = engine
            .execute(Role::Tts, &[Tier::Network], &providers, &cancel, |_p| {
                let trigger = trigger.clone();
                async move {
                    trigger.cancel();
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok("never")
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err, FailureReason::UserCancelled);
        assert_eq!(registry.get(Role::Tts, "a").unwrap().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_starts_when_armed() {
        let (engine, _) = engine(&[("a", 1)]);
        let providers = set(&[&Scripted::new("a", vec![])]);
        let (arm, armed) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let _ = arm.send(true);
        });

        // Finishes 2s after arming, 32s after the call began
        let result = engine
            .execute_armed(
                Role::Tts,
                &[Tier::Network],
                &providers,
                &CancellationToken::new(),
                || {
                    let mut armed = armed.clone();
                    async move {
                        let _ = armed.wait_for(|armed| *armed).await;
                    }
                },
                |p| async move {
                    tokio::time::sleep(Duration::from_secs(32)).await;
                    p.next()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.attempts, 1);
    }
}
