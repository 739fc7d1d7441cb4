// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policy
//!
//! A bounded retry policy and a combinator that applies it to any async
//! operation. Errors decide for themselves whether another attempt makes sense
//! through the [`Retryable`] trait.

use crate::{configs::PublisherConfigs, errors::AmqpError};
use std::{future::Future, time::Duration};
use tracing::warn;

/// Strategy for calculating the delay before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// Same delay between every attempt.
    #[default]
    Fixed,
    /// Delay grows by `base_delay` each attempt.
    Linear,
    /// Delay doubles each attempt.
    Exponential,
}

/// How many times an operation runs and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_strategy: BackoffStrategy::Fixed,
        }
    }
}

impl From<&PublisherConfigs> for RetryPolicy {
    fn from(cfg: &PublisherConfigs) -> Self {
        RetryPolicy {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: cfg.backoff,
            ..Default::default()
        }
    }
}

impl RetryPolicy {
    /// A policy that runs the operation once.
    pub fn no_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after the failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let delay = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt.max(1)),
            BackoffStrategy::Exponential => {
                let exp = attempt.saturating_sub(1).min(31);
                self.base_delay.saturating_mul(1u32 << exp)
            }
        };

        match self.backoff_strategy {
            BackoffStrategy::Fixed => delay,
            _ => delay.min(self.max_delay),
        }
    }
}

/// Errors that know whether a later attempt may succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for AmqpError {
    fn is_retryable(&self) -> bool {
        AmqpError::is_retryable(self)
    }
}

/// Outcome of an operation that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// A non-retryable error; surfaced on the attempt that produced it.
    Fatal { attempt: u32, error: E },
    /// Every attempt failed; carries the last error.
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal { error, .. } => error,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Runs `op` until it succeeds, fails fatally, or the policy runs out.
///
/// `op` receives the 1-based attempt number. The delay from the policy is
/// awaited between attempts, never after the last one.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, RetryError<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_retryable() {
            return Err(RetryError::Fatal { attempt, error });
        }

        let remaining = max_attempts - attempt;
        warn!(error = error.to_string(), attempt, remaining, "attempt failed");

        if remaining == 0 {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        tokio::time::sleep(policy.delay_after(attempt)).await;
        attempt += 1;
    }
}
