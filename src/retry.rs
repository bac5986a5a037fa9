// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry With Backoff
//!
//! A single retry helper shared by the publisher, the topology initializer and
//! the startup sequence. A [`RetryPolicy`] states how many retries follow the
//! first attempt and how long to wait before each of them.

use std::{fmt::Display, future::Future, time::Duration};
use tracing::{debug, warn};

/// Delay schedule applied between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Waits `initial * 2^(retry - 1)` before the n-th retry.
    Exponential { initial: Duration },
    /// Waits the same amount before every retry.
    Fixed(Duration),
}

impl Backoff {
    /// Delay before the given retry, counting retries from 1.
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Exponential { initial } => {
                let exponent = retry.saturating_sub(1).min(31);
                initial.saturating_mul(1u32 << exponent)
            }
            Backoff::Fixed(delay) => delay,
        }
    }
}

/// How many times an operation is retried after its first failure and how
/// long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn exponential(max_retries: u32, initial: Duration) -> Self {
        RetryPolicy {
            max_retries,
            backoff: Backoff::Exponential { initial },
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        RetryPolicy {
            max_retries,
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Publisher policy: 3 retries waiting 1s, 2s and 4s.
    pub fn publisher() -> Self {
        RetryPolicy::exponential(3, Duration::from_secs(1))
    }

    /// Topology declaration policy: 3 retries waiting 2s, 4s and 8s.
    pub fn topology() -> Self {
        RetryPolicy::exponential(3, Duration::from_secs(2))
    }

    /// Whole-initialization policy used at process startup: 5 attempts, 1s apart.
    pub fn startup() -> Self {
        RetryPolicy::fixed(4, Duration::from_secs(1))
    }

    /// Consumer resubscription policy after a lost connection: 12 retries, 5s apart.
    pub fn reconnect() -> Self {
        RetryPolicy::fixed(12, Duration::from_secs(5))
    }

    /// Total number of attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Runs `operation` until it succeeds or the policy is exhausted, sleeping
/// between attempts. The last error is returned when every attempt failed.
///
/// # Example
/// ```ignore
/// let policy = RetryPolicy::publisher();
/// retry_with_backoff(&policy, "publish", || async { publish_once().await }).await?;
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut retry = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if retry > 0 {
                    debug!(operation = operation_name, retry, "operation succeeded after retries");
                }
                return Ok(result);
            }
            Err(err) => {
                if retry >= policy.max_retries {
                    warn!(
                        operation = operation_name,
                        attempts = policy.max_attempts(),
                        error = %err,
                        "operation failed, retries exhausted"
                    );
                    return Err(err);
                }

                retry += 1;
                let delay = policy.backoff.delay(retry);

                warn!(
                    operation = operation_name,
                    retry,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
