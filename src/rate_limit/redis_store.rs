use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;

/// Counters shared by every process pointing at the same Redis.
#[derive(Clone)]
pub struct RedisStore {
    redis: Arc<redis::Client>,
    window: Duration,
}

impl RedisStore {
    pub fn new(redis: redis::Client, window: Duration) -> Self {
        Self {
            redis: Arc::new(redis),
            window,
        }
    }

    /// Count one request for `key`. Returns the count and the milliseconds
    /// left in the window.
    pub async fn hit(&self, key: &str) -> Result<(u64, u64), redis::RedisError> {
        let key = format!("rate_limit:{}", key);
        let window_ms = self.window.as_millis() as i64;
        let mut conn = self.redis.get_multiplexed_async_connection().await?;

        let count: u64 = conn.incr(&key, 1).await?;
        if count == 1 {
            // first request opens the window
            let _: () = conn.pexpire(&key, window_ms).await?;
        }

        let mut ttl: i64 = conn.pttl(&key).await?;
        if ttl < 0 {
            // key lost its expiry, e.g. a crash between INCR and PEXPIRE
            let _: () = conn.pexpire(&key, window_ms).await?;
            ttl = window_ms;
        }

        Ok((count, ttl as u64))
    }
}
