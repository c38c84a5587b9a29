//! Per-task rate limiting
//!
//! Token buckets are backed by `governor`. A task may configure several
//! buckets (for example 1 request/second and 20 requests/minute); the
//! [`MultiLimiter`] admits a request only once every bucket has.

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::error::LimitError;

/// Blocks until a request is permitted
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), LimitError>;
}

/// One token-bucket rule from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Events allowed per window
    pub event_count: u32,

    /// Window length in seconds
    pub event_dur_secs: u64,

    /// Burst size
    #[serde(default = "default_bucket")]
    pub bucket: u32,
}

fn default_bucket() -> u32 {
    1
}

/// Limiter that never waits
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), LimitError> {
        if cancel.is_cancelled() {
            return Err(LimitError::Cancelled);
        }
        Ok(())
    }
}

/// Single token bucket
pub struct TokenBucket {
    inner: DefaultDirectRateLimiter,
}

impl TokenBucket {
    /// `count` events every `window`, with the given burst
    pub fn per(count: u32, window: Duration, burst: u32) -> Result<Self, LimitError> {
        let count = NonZeroU32::new(count)
            .ok_or_else(|| LimitError::InsufficientCapacity("event_count must be > 0".into()))?;
        let period = window / count.get();
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(period)
            .ok_or_else(|| LimitError::InsufficientCapacity("window must be > 0".into()))?
            .allow_burst(burst);

        Ok(Self {
            inner: governor::RateLimiter::direct(quota),
        })
    }

    pub fn from_config(config: &LimitConfig) -> Result<Self, LimitError> {
        Self::per(
            config.event_count,
            Duration::from_secs(config.event_dur_secs),
            config.bucket,
        )
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), LimitError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(LimitError::Cancelled),
            _ = self.inner.until_ready() => Ok(()),
        }
    }
}

/// Combination of limiters, all of which must admit
pub struct MultiLimiter {
    limiters: Vec<Arc<dyn RateLimiter>>,
}

impl MultiLimiter {
    pub fn new(limiters: Vec<Arc<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

#[async_trait]
impl RateLimiter for MultiLimiter {
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), LimitError> {
        for limiter in &self.limiters {
            limiter.wait(cancel).await?;
        }
        Ok(())
    }
}

/// Build the limiter for a task's configured buckets
///
/// Invalid entries are skipped with a warning; no entries means unlimited.
pub fn from_configs(configs: &[LimitConfig]) -> Arc<dyn RateLimiter> {
    let mut limiters: Vec<Arc<dyn RateLimiter>> = Vec::with_capacity(configs.len());
    for config in configs {
        match TokenBucket::from_config(config) {
            Ok(bucket) => limiters.push(Arc::new(bucket)),
            Err(e) => tracing::warn!(?config, error = %e, "Ignoring invalid rate limit"),
        }
    }

    match limiters.len() {
        0 => Arc::new(Unlimited),
        1 => limiters.remove(0),
        _ => Arc::new(MultiLimiter::new(limiters)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_unlimited_respects_cancellation() {
        let cancel = CancellationToken::new();
        assert!(Unlimited.wait(&cancel).await.is_ok());
        cancel.cancel();
        assert_eq!(Unlimited.wait(&cancel).await, Err(LimitError::Cancelled));
    }

    #[tokio::test]
    async fn test_token_bucket_burst_then_wait() {
        let bucket = TokenBucket::per(10, Duration::from_secs(1), 2).unwrap();
        let cancel = CancellationToken::new();

        let start = Instant::now();
        bucket.wait(&cancel).await.unwrap();
        bucket.wait(&cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));

        bucket.wait(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_cancelled_wait_aborts() {
        let bucket = TokenBucket::per(1, Duration::from_secs(60), 1).unwrap();
        let cancel = CancellationToken::new();
        bucket.wait(&cancel).await.unwrap();

        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            child.cancel();
        });
        assert_eq!(bucket.wait(&cancel).await, Err(LimitError::Cancelled));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(TokenBucket::per(0, Duration::from_secs(1), 1).is_err());
        assert!(TokenBucket::per(1, Duration::ZERO, 1).is_err());
    }

    #[tokio::test]
    async fn test_from_configs_combines_buckets() {
        let configs = vec![
            LimitConfig { event_count: 100, event_dur_secs: 1, bucket: 5 },
            LimitConfig { event_count: 0, event_dur_secs: 1, bucket: 1 },
            LimitConfig { event_count: 600, event_dur_secs: 60, bucket: 5 },
        ];
        let limiter = from_configs(&configs);
        let cancel = CancellationToken::new();
        for _ in 0..5 {
            limiter.wait(&cancel).await.unwrap();
        }

        let none = from_configs(&[]);
        assert!(none.wait(&cancel).await.is_ok());
    }
}
