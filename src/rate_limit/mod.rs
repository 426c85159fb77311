//! Fixed-window request counting.
//!
//! By default counters live in process memory, so several server processes
//! each enforce the limit on their own. Pointing the limiter at Redis shares
//! the counters instead.

mod memory;
mod redis_store;

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::config::Config;

pub use memory::{MemoryStore, RateLimitEntry};
pub use redis_store::RedisStore;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max: u32,
    /// Body of the 429 response.
    pub message: Value,
    pub trust_proxy: bool,
}

impl RateLimitConfig {
    pub fn new(window: Duration, max: u32, message: Value) -> Self {
        Self {
            window,
            max,
            message,
            trust_proxy: false,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            window: config.rate_limit_window(),
            max: config.rate_limit_max,
            message: config.rate_limit_message.clone(),
            trust_proxy: config.trust_proxy,
        }
    }
}

/// Result of counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub limit: u32,
    pub count: u64,
    /// Unix time, in whole seconds rounded up, at which the window ends.
    pub reset_at: i64,
}

impl RateLimitDecision {
    pub fn allowed(&self) -> bool {
        self.count <= u64::from(self.limit)
    }

    pub fn remaining(&self) -> u32 {
        u64::from(self.limit).saturating_sub(self.count) as u32
    }
}

enum Store {
    Memory(Arc<MemoryStore>),
    Redis(RedisStore),
}

pub struct RateLimiter {
    config: RateLimitConfig,
    store: Store,
    sweeper: Option<JoinHandle<()>>,
}

impl RateLimiter {
    /// In-memory limiter. When called inside a tokio runtime a sweep task
    /// removes expired entries every window.
    pub fn new(config: RateLimitConfig) -> Self {
        let store = Arc::new(MemoryStore::new(config.window));
        let sweeper = spawn_sweeper(&store, config.window);
        Self {
            config,
            store: Store::Memory(store),
            sweeper,
        }
    }

    pub fn with_redis(config: RateLimitConfig, redis: redis::Client) -> Self {
        let store = RedisStore::new(redis, config.window);
        Self {
            config,
            store: Store::Redis(store),
            sweeper: None,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request for `key`. Never fails: a Redis error lets the
    /// request through.
    pub async fn hit(&self, key: &str) -> RateLimitDecision {
        match &self.store {
            Store::Memory(store) => {
                let now = Instant::now();
                let entry = store.hit(key, now);
                self.decision(entry.count, entry.reset_time.saturating_duration_since(now))
            }
            Store::Redis(store) => match store.hit(key).await {
                Ok((count, ttl_ms)) => self.decision(count, Duration::from_millis(ttl_ms)),
                Err(e) => {
                    tracing::error!(key, error = %e, "rate limit store unavailable, allowing request");
                    self.decision(0, self.config.window)
                }
            },
        }
    }

    /// Number of keys tracked in memory. Always 0 for the Redis store.
    pub fn tracked_keys(&self) -> usize {
        match &self.store {
            Store::Memory(store) => store.len(),
            Store::Redis(_) => 0,
        }
    }

    fn decision(&self, count: u64, until_reset: Duration) -> RateLimitDecision {
        let reset_ms = chrono::Utc::now().timestamp_millis() + until_reset.as_millis() as i64;
        RateLimitDecision {
            limit: self.config.max,
            count,
            reset_at: (reset_ms + 999).div_euclid(1000),
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

// The task only holds a weak reference so it never keeps the store alive.
fn spawn_sweeper(store: &Arc<MemoryStore>, window: Duration) -> Option<JoinHandle<()>> {
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            tracing::warn!("no tokio runtime, rate limit sweep disabled");
            return None;
        }
    };
    let every = if window.is_zero() {
        Duration::from_secs(1)
    } else {
        window
    };
    let store = Arc::downgrade(store);

    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        loop {
            ticker.tick().await;
            let Some(store) = store.upgrade() else {
                break;
            };
            let removed = store.sweep(Instant::now());
            if removed > 0 {
                tracing::debug!(removed, remaining = store.len(), "swept expired rate limit entries");
            }
        }
    }))
}
