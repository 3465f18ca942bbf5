//! Retry policy executor for unary calls.
//!
//! Attempt 1 runs immediately. A failure whose code is in the retryable set
//! is retried after an exponential backoff, capped at `max_backoff`, until
//! `max_attempts` is reached. The optional deadline bounds the whole loop,
//! backoff sleeps included.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{Error, Result, RetryConfig};

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RetryableFailure,
    TerminalFailure,
}

/// One entry of the attempt log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub number: u32,
    /// Delay slept before this attempt (zero for the first).
    pub backoff: Duration,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retrying after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let max = self.config.max_backoff;
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.config.initial_backoff.as_nanos() as f64 * self.config.backoff_multiplier.powi(exp);
        if !nanos.is_finite() || nanos >= max.as_nanos() as f64 {
            max
        } else {
            Duration::from_nanos(nanos.round() as u64)
        }
    }

    /// Whether `err` from attempt `attempt` warrants another attempt.
    pub fn should_retry(&self, err: &Error, attempt: u32) -> bool {
        attempt < self.config.max_attempts
            && !err.is_terminal()
            && self.config.retryable_codes.contains(&err.code())
    }

    /// Run `call` under the policy, returning the final result.
    pub async fn run<T, F, Fut>(&self, method: &str, deadline: Option<Instant>, call: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_recorded(method, deadline, call).await.0
    }

    /// Like [`run`](Self::run), also returning the attempt log.
    pub async fn run_recorded<T, F, Fut>(
        &self,
        method: &str,
        deadline: Option<Instant>,
        call: F,
    ) -> (Result<T>, Vec<RetryAttempt>)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut log = Vec::new();
        let attempts = self.attempts(method, call, &mut log);
        let result = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, attempts).await,
            None => Ok(attempts.await),
        };
        match result {
            Ok(result) => (result, log),
            Err(_) => {
                tracing::debug!(method = %method, attempts = log.len(), "call_deadline_exceeded");
                (Err(Error::DeadlineExceeded), log)
            }
        }
    }

    async fn attempts<T, F, Fut>(&self, method: &str, mut call: F, log: &mut Vec<RetryAttempt>) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut number = 1;
        let mut backoff = Duration::ZERO;
        loop {
            match call(number).await {
                Ok(value) => {
                    log.push(RetryAttempt {
                        number,
                        backoff,
                        outcome: Outcome::Success,
                    });
                    return Ok(value);
                }
                Err(err) if self.should_retry(&err, number) => {
                    log.push(RetryAttempt {
                        number,
                        backoff,
                        outcome: Outcome::RetryableFailure,
                    });
                    backoff = self.backoff(number);
                    tracing::debug!(
                        method = %method,
                        attempt = number,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying: {}",
                        err
                    );
                    tokio::time::sleep(backoff).await;
                    number += 1;
                }
                Err(err) => {
                    log.push(RetryAttempt {
                        number,
                        backoff,
                        outcome: Outcome::TerminalFailure,
                    });
                    if number > 1 {
                        tracing::debug!(method = %method, attempts = number, "retries_exhausted: {}", err);
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
