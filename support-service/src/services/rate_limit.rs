//! Per-subject fixed-window rate limiting on top of the cache store.

use crate::services::cache::CacheStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CacheStore>,
    max_requests: u32,
    window_secs: u64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CacheStore>, max_requests: u32, window_secs: u64) -> Self {
        Self {
            store,
            max_requests,
            window_secs,
        }
    }

    pub fn key(subject: &str) -> String {
        format!("ratelimit:{}", subject)
    }

    /// Count one request for `subject`. A failing cache lets the request through.
    pub async fn check(&self, subject: &str) -> RateLimitDecision {
        match self.store.incr_window(&Self::key(subject), self.window_secs).await {
            Ok((count, ttl)) => RateLimitDecision {
                allowed: count <= self.max_requests as u64,
                remaining: (self.max_requests as u64).saturating_sub(count) as u32,
                reset_at: Utc::now() + Duration::seconds(ttl as i64),
            },
            Err(e) => {
                tracing::warn!(error = %e, subject = %subject, "Rate limit check failed, allowing request");
                RateLimitDecision {
                    allowed: true,
                    remaining: self.max_requests,
                    reset_at: Utc::now() + Duration::seconds(self.window_secs as i64),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::MemoryCache;
    use async_trait::async_trait;

    struct BrokenCache;

    #[async_trait]
    impl CacheStore for BrokenCache {
        async fn get(&self, _: &str) -> Result<Option<String>, anyhow::Error> {
            Err(anyhow::anyhow!("down"))
        }
        async fn set_ex(&self, _: &str, _: &str, _: u64) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("down"))
        }
        async fn delete(&self, _: &str) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("down"))
        }
        async fn expire(&self, _: &str, _: u64) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("down"))
        }
        async fn push_bounded(&self, _: &str, _: &str, _: usize, _: u64) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("down"))
        }
        async fn list_range(&self, _: &str) -> Result<Vec<String>, anyhow::Error> {
            Err(anyhow::anyhow!("down"))
        }
        async fn incr_window(&self, _: &str, _: u64) -> Result<(u64, u64), anyhow::Error> {
            Err(anyhow::anyhow!("down"))
        }
        async fn health_check(&self) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("down"))
        }
    }

    #[tokio::test]
    async fn blocks_after_limit_within_window() {
        let limiter = RateLimiter::new(Arc::new(MemoryCache::new()), 3, 60);
        for _ in 0..3 {
            assert!(limiter.check("emp-1").await.allowed);
        }
        let blocked = limiter.check("emp-1").await;
        assert!(!blocked.allowed);
        assert_eq!(blocked.remaining, 0);
        assert!(blocked.reset_at > Utc::now());

        assert!(limiter.check("emp-2").await.allowed);
    }

    #[tokio::test]
    async fn cache_failure_fails_open() {
        let limiter = RateLimiter::new(Arc::new(BrokenCache), 1, 60);
        assert!(limiter.check("emp-1").await.allowed);
        assert!(limiter.check("emp-1").await.allowed);
    }
}
