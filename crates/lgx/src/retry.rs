//! 🔄 Retry: bounded attempts, pluggable backoff, one shot at remediation.
//!
//! 🎬 *[the engine says 503. we wait. the engine says 503. we wait longer.
//! the engine says 200. nobody claps, but everyone is relieved.]*
//!
//! The policy (how many tries, how long between them, which statuses are
//! hopeless) is plain data. The sleeping is behind `Sleeper` so tests do not
//! sit around for real. A 403/409 gets exactly one call to the `Remediation`
//! hook (role mapping) before it is treated like any other retryable failure.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::error::IndexError;

/// ⏱️ How long to wait before attempt `n + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// ⏱️ Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(*max)
            }
        }
    }
}

/// 📜 Max attempts, backoff, and the statuses not worth a second try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub fatal_statuses: Vec<u16>,
}

impl RetryPolicy {
    /// 🏷️ Retryable under this policy?
    pub fn is_retryable(&self, err: &IndexError) -> bool {
        match err.status() {
            Some(status) if self.fatal_statuses.contains(&status) => false,
            _ => err.is_retryable(),
        }
    }
}

/// ⚙️ One retry policy as it appears in config.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicyConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub fatal_statuses: Vec<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffKind::default(),
            delay_ms: default_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            fatal_statuses: Vec::new(),
        }
    }
}

impl RetryPolicyConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.delay_ms);
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff: match self.backoff {
                BackoffKind::Fixed => Backoff::Fixed(delay),
                BackoffKind::Exponential => Backoff::Exponential {
                    base: delay,
                    max: Duration::from_millis(self.max_delay_ms),
                },
            },
            fatal_statuses: self.fatal_statuses.clone(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

/// ⚙️ `[retry]` section: one policy for bulk submits, one for setup calls.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub bulk: RetryPolicyConfig,
    #[serde(default)]
    pub setup: RetryPolicyConfig,
}

/// 😴 Something that can wait.
#[async_trait]
pub trait Sleeper: fmt::Debug + Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// 😴 The real one.
#[derive(Debug, Clone, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// 🩹 One-time fix-up for permission refusals.
#[async_trait]
pub trait Remediation: Send + Sync {
    async fn remediate(&self) -> Result<(), IndexError>;
}

/// 🔄 Runs a call under a `RetryPolicy`.
#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { policy, sleeper }
    }

    pub fn tokio(policy: RetryPolicy) -> Self {
        Self::new(policy, Arc::new(TokioSleeper))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 🔄 Call `call` until it succeeds, hits a fatal error, or runs out of attempts.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        remediation: Option<&dyn Remediation>,
        mut call: F,
    ) -> Result<T, IndexError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IndexError>>,
    {
        let mut remediated = false;
        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !self.policy.is_retryable(&err) {
                if err.is_backpressure() {
                    debug!("🧱 {operation} pushed back on attempt {attempt}: {err}");
                } else {
                    error!("💀 {operation} failed with a non-retryable error on attempt {attempt}: {err}");
                }
                return Err(err);
            }
            if err.wants_remediation() && !remediated {
                remediated = true;
                if let Some(fix) = remediation {
                    info!("🩹 {operation} was refused ({err}), attempting remediation");
                    if let Err(fix_err) = fix.remediate().await {
                        warn!("🩹 remediation for {operation} failed: {fix_err}");
                    }
                }
            }
            last_error = err.to_string();
            if attempt < self.policy.max_attempts {
                let delay = self.policy.backoff.delay(attempt);
                warn!(
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    "🔄 {operation} failed, retrying in {:?}: {err}",
                    delay
                );
                self.sleeper.sleep(delay).await;
            }
        }
        error!("💀 {operation} exhausted {} attempts", self.policy.max_attempts);
        Err(IndexError::Exhausted {
            operation: operation.to_string(),
            attempts: self.policy.max_attempts,
            last: last_error,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 😴 Records what it was asked to sleep, sleeps for none of it.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSleeper {
        pub(crate) naps: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.naps.lock().expect("nap log poisoned").push(duration);
        }
    }

    pub(crate) fn instant_controller(max_attempts: u32) -> RetryController {
        RetryController::new(
            RetryPolicy {
                max_attempts,
                backoff: Backoff::Fixed(Duration::from_millis(10)),
                fatal_statuses: Vec::new(),
            },
            Arc::new(RecordingSleeper::default()),
        )
    }

    #[derive(Default)]
    struct CountingRemediation {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Remediation for CountingRemediation {
        async fn remediate(&self) -> Result<(), IndexError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn transient() -> IndexError {
        IndexError::from_status("op", 503, "busy".into())
    }

    #[test]
    fn the_one_where_exponential_backoff_hits_the_ceiling() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
        };
        let delays: Vec<u64> = (1..=5).map(|a| backoff.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        assert_eq!(Backoff::Fixed(Duration::from_secs(3)).delay(9), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn the_one_where_the_third_time_is_the_charm() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let controller = RetryController::new(
            RetryPolicy {
                max_attempts: 3,
                backoff: Backoff::Fixed(Duration::from_secs(10)),
                fatal_statuses: Vec::new(),
            },
            sleeper.clone(),
        );
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = controller
            .run("op", None, || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok("finally")
                }
            })
            .await;
        assert_eq!(result.ok(), Some("finally"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let naps = sleeper.naps.lock().expect("nap log").clone();
        assert_eq!(naps, vec![Duration::from_secs(10); 2]);
    }

    #[tokio::test]
    async fn the_one_where_patience_runs_out() {
        let controller = instant_controller(2);
        let result: Result<(), _> = controller.run("bulk", None, || async { Err(transient()) }).await;
        match result {
            Err(IndexError::Exhausted { attempts, operation, .. }) => {
                assert_eq!(attempts, 2);
                assert_eq!(operation, "bulk");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn the_one_where_remediation_happens_exactly_once() {
        let controller = instant_controller(4);
        let fix = CountingRemediation::default();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = controller
            .run("ism put", Some(&fix), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(IndexError::from_status("ism put", 403, "no".into()))
            })
            .await;
        assert!(matches!(result, Err(IndexError::Exhausted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(fix.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn the_one_where_a_fatal_status_stops_immediately() {
        let controller = RetryController::new(
            RetryPolicy {
                max_attempts: 5,
                backoff: Backoff::Fixed(Duration::ZERO),
                fatal_statuses: vec![400],
            },
            Arc::new(RecordingSleeper::default()),
        );
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = controller
            .run("template", None, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(IndexError::from_status("template", 400, "bad mapping".into()))
            })
            .await;
        assert!(matches!(result, Err(IndexError::Transient { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn the_one_where_oversize_is_handed_straight_back() {
        let controller = instant_controller(3);
        let result: Result<(), _> = controller
            .run("bulk", None, || async {
                Err(IndexError::Oversize {
                    index: "logs".into(),
                    new_batch_size: 4000,
                })
            })
            .await;
        assert!(matches!(result, Err(IndexError::Oversize { new_batch_size: 4000, .. })));
    }

    #[test]
    fn the_one_where_config_becomes_a_policy() {
        let config: RetryPolicyConfig = toml::from_str(
            r#"
            max_attempts = 0
            backoff = "exponential"
            delay_ms = 250
            max_delay_ms = 1000
            "#,
        )
        .expect("valid toml");
        let policy = config.to_policy();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(
            policy.backoff,
            Backoff::Exponential {
                base: Duration::from_millis(250),
                max: Duration::from_secs(1)
            }
        );
    }
}
