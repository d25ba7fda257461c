//! Exponential backoff with jitter.
//!
//! `execute` runs an operation up to `max_retries + 1` times. The delay before
//! the k-th retry is `min(base_delay * multiplier^(k-1), max_delay)`, perturbed
//! by a uniform draw in `±jitter_fraction * delay`. When retries run out the
//! last error is returned unchanged.
//!
//! The async variants sleep on the tokio timer; [`Backoff::execute_blocking`]
//! uses the same delay math with `std::thread::sleep` for callers that live on
//! a plain worker thread.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Configuration for a backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Retries after the first attempt (0 = run once).
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Upper bound for any single delay (before jitter).
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Fraction of the delay used as the jitter half-width, in `[0, 1]`.
    pub jitter_fraction: f64,
}

impl BackoffConfig {
    /// Reads against a local database: quick, few retries.
    pub fn database() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }

    /// Remote calls: slower, more patient.
    pub fn network() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_fraction: 0.2,
        }
    }

    /// UI / OS automation steps.
    pub fn automation() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }

    /// A policy that never sleeps, useful in tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter_fraction: 0.0,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::network()
    }
}

/// Outcome of a cancellable execution.
#[derive(Debug, PartialEq, Eq)]
pub enum BackoffError<E> {
    Cancelled,
    Operation(E),
}

impl<E: fmt::Display> fmt::Display for BackoffError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("operation cancelled"),
            Self::Operation(err) => err.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BackoffError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cancelled => None,
            Self::Operation(err) => Some(err),
        }
    }
}

/// A retry policy built from a [`BackoffConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.config.base_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        let capped = base.min(self.config.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Delay before retry number `retry`, perturbed by uniform jitter.
    pub fn jittered_delay(&self, retry: u32) -> Duration {
        let delay = self.delay_for_retry(retry).as_secs_f64();
        let spread = delay * self.config.jitter_fraction.clamp(0.0, 1.0);
        if spread <= 0.0 {
            return Duration::from_secs_f64(delay);
        }
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((delay + offset).max(0.0))
    }

    /// Run `op` with retries, sleeping on the tokio timer between attempts.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with(op, |_, _: &E, _| {}).await
    }

    /// Like [`execute`](Self::execute), calling `on_retry(retry, &error, delay)`
    /// before each sleep. The callback never sees the final error: that one is
    /// returned to the caller.
    pub async fn execute_with<T, E, F, Fut, R>(&self, mut op: F, mut on_retry: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(u32, &E, Duration),
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if retry < self.config.max_retries => {
                    retry += 1;
                    let delay = self.jittered_delay(retry);
                    on_retry(retry, &err, delay);
                    debug!(retry, delay_ms = delay.as_millis() as u64, "Backoff: retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Run `op` with retries until it succeeds, retries run out, or `cancel`
    /// fires. Cancellation interrupts a pending sleep or attempt immediately.
    pub async fn execute_cancellable<T, E, F, Fut>(
        &self,
        mut op: F,
        cancel: &CancellationToken,
    ) -> Result<T, BackoffError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retry = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(BackoffError::Cancelled);
            }
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackoffError::Cancelled),
                outcome = op() => outcome,
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(_) if retry < self.config.max_retries => {
                    retry += 1;
                    let delay = self.jittered_delay(retry);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(BackoffError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(BackoffError::Operation(err)),
            }
        }
    }

    /// Blocking variant with identical delay math.
    pub fn execute_blocking<T, E, F>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
    {
        let mut retry = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(_) if retry < self.config.max_retries => {
                    retry += 1;
                    std::thread::sleep(self.jittered_delay(retry));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
