use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::warn;
use uuid::Uuid;

/// A windowed hit counter. Two implementations: an in-process map
/// (best-effort, single instance) and a shared Redis counter
/// (authoritative across instances).
#[async_trait]
pub trait Counter: Send + Sync {
    /// Record one hit against `key` and return the total number of hits in
    /// the current window, including this one.
    async fn incr(&self, key: &str, window: Duration) -> Result<u64>;
}

/// Fixed-window counter held in process memory. Under horizontal scaling
/// each instance counts independently, so the effective global limit can
/// reach N× the configured one (N = instance count) — accepted operational
/// caveat when no shared store is available.
pub struct LocalCounter {
    windows: Mutex<HashMap<String, (Instant, u64)>>,
}

impl LocalCounter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn incr_sync(&self, key: &str, window: Duration) -> u64 {
        let mut windows = self.windows.lock().expect("rate-limit lock poisoned");
        let now = Instant::now();
        let entry = windows.entry(key.to_string()).or_insert((now, 0));
        if now.duration_since(entry.0) >= window {
            *entry = (now, 0);
        }
        entry.1 += 1;
        entry.1
    }
}

impl Default for LocalCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Counter for LocalCounter {
    async fn incr(&self, key: &str, window: Duration) -> Result<u64> {
        Ok(self.incr_sync(key, window))
    }
}

/// Shared counter over Redis: INCR plus EXPIRE on the first hit, so the key
/// self-destructs when the window elapses.
pub struct RedisCounter {
    conn: ConnectionManager,
}

impl RedisCounter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Counter for RedisCounter {
    async fn incr(&self, key: &str, window: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let redis_key = format!("rate:msg:{}", key);

        let count: u64 = conn.incr(&redis_key, 1u64).await?;
        if count == 1 {
            let _: () = conn.expire(&redis_key, window.as_secs() as i64).await?;
        }
        Ok(count)
    }
}

/// Bounds message sends per sender per window. The shared counter is
/// preferred when configured; on a shared-store failure we answer from the
/// process-local window instead of refusing service.
pub struct RateLimiter {
    shared: Option<Arc<dyn Counter>>,
    local: LocalCounter,
    limit: u64,
    window: Duration,
}

impl RateLimiter {
    /// Process-local limiter.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            shared: None,
            local: LocalCounter::new(),
            limit,
            window,
        }
    }

    /// Limiter backed by a shared counter, with local fallback.
    pub fn with_shared(limit: u64, window: Duration, shared: Arc<dyn Counter>) -> Self {
        Self {
            shared: Some(shared),
            local: LocalCounter::new(),
            limit,
            window,
        }
    }

    /// Record one send attempt for `sender` and report whether it is within
    /// quota. Rejected attempts still count toward the window.
    pub async fn check(&self, sender: Uuid) -> bool {
        let key = sender.to_string();
        let count = match &self.shared {
            Some(counter) => match counter.incr(&key, self.window).await {
                Ok(count) => count,
                Err(e) => {
                    warn!("Shared rate-limit counter unavailable, using local window: {}", e);
                    self.local.incr_sync(&key, self.window)
                }
            },
            None => self.local.incr_sync(&key, self.window),
        };
        count <= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenCounter;

    #[async_trait]
    impl Counter for BrokenCounter {
        async fn incr(&self, _key: &str, _window: Duration) -> Result<u64> {
            anyhow::bail!("shared store unreachable")
        }
    }

    #[tokio::test]
    async fn allows_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new(10, Duration::from_secs(60));
        let sender = Uuid::new_v4();

        for _ in 0..10 {
            assert!(limiter.check(sender).await);
        }
        assert!(!limiter.check(sender).await);
    }

    #[tokio::test]
    async fn windows_are_per_sender() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(limiter.check(a).await);
        assert!(!limiter.check(a).await);
        assert!(limiter.check(b).await);
    }

    #[tokio::test]
    async fn window_elapses_and_quota_returns() {
        let limiter = RateLimiter::new(1, Duration::from_millis(40));
        let sender = Uuid::new_v4();

        assert!(limiter.check(sender).await);
        assert!(!limiter.check(sender).await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.check(sender).await);
    }

    #[tokio::test]
    async fn falls_back_to_local_when_shared_store_fails() {
        let limiter =
            RateLimiter::with_shared(1, Duration::from_secs(60), Arc::new(BrokenCounter));
        let sender = Uuid::new_v4();

        assert!(limiter.check(sender).await);
        assert!(!limiter.check(sender).await);
    }
}
