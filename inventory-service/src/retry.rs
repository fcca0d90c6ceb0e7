//! Conflict-retry loop around one [`Mutation`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::FulfillmentError;
use crate::mutation::Mutation;
use crate::store::{StockStore, StockTransaction};

/// Backoff strategy between conflicting attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// base * attempt
    #[default]
    Linear,
    /// base * 2^(attempt - 1)
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Linear,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, strategy: BackoffStrategy) -> Self {
        Self {
            max_attempts,
            base_delay,
            strategy,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay to wait after the given (1-indexed) attempt conflicted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => self.base_delay.saturating_mul(2u32.saturating_pow(attempt - 1)),
        };
        delay.min(self.max_delay)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Result of a mutation that made it to a successful commit.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed<T> {
    pub output: T,
    /// Attempts used, 1 when the first transaction committed.
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RetryLoop<Z = TokioSleeper> {
    policy: RetryPolicy,
    sleeper: Z,
}

impl RetryLoop<TokioSleeper> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_sleeper(policy, TokioSleeper)
    }
}

impl<Z: Sleeper> RetryLoop<Z> {
    pub fn with_sleeper(policy: RetryPolicy, sleeper: Z) -> Self {
        Self { policy, sleeper }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `mutation` in a fresh serializable transaction per attempt.
    ///
    /// Conflicts, whether raised while executing or while committing, roll
    /// back, back off and retry until the policy runs out. Any other error
    /// rolls back and is returned as is. The error side never carries
    /// [`FulfillmentError::TransientConflict`].
    pub async fn run<S, M>(&self, store: &S, mutation: &M) -> Result<Committed<M::Output>, FulfillmentError>
    where
        S: StockStore,
        M: Mutation,
    {
        let max_attempts = self.policy.attempts();
        let mut attempt = 1;

        loop {
            let mut tx = store.begin().await?;

            let result = match mutation.apply(&mut tx).await {
                Ok(output) => tx.commit().await.map(|()| output),
                Err(e) => {
                    if let Err(rollback_error) = tx.rollback().await {
                        warn!(error = %rollback_error, "rollback failed");
                    }
                    Err(e)
                }
            };

            match result {
                Ok(output) => return Ok(Committed { output, attempts: attempt }),
                Err(e) if e.is_transient() => {
                    if attempt >= max_attempts {
                        error!(attempts = attempt, error = %e, "giving up on serialization conflicts");
                        return Err(FulfillmentError::ConflictExhausted { attempts: attempt });
                    }
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "serialization failure, retrying"
                    );
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Records requested delays instead of waiting.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingSleeper {
    slept: std::sync::Arc<std::sync::Mutex<Vec<Duration>>>,
}

#[cfg(test)]
impl RecordingSleeper {
    pub(crate) fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}
