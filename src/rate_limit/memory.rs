use dashmap::DashMap;
use tokio::time::{Duration, Instant};

/// Counter for one key inside its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u64,
    pub reset_time: Instant,
}

impl RateLimitEntry {
    fn fresh(now: Instant, window: Duration) -> Self {
        Self {
            count: 0,
            reset_time: now + window,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.reset_time
    }
}

/// Per-process fixed-window counters. State is not shared between processes.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, RateLimitEntry>,
    window: Duration,
}

impl MemoryStore {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            window,
        }
    }

    /// Count one request for `key` and return the updated entry.
    pub fn hit(&self, key: &str, now: Instant) -> RateLimitEntry {
        let window = self.window;
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry::fresh(now, window));

        // replaced, not incremented
        if entry.is_expired(now) {
            *entry = RateLimitEntry::fresh(now, window);
        }
        entry.count += 1;
        *entry
    }

    pub fn get(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.get(key).map(|e| *e)
    }

    /// Drop every entry whose window has elapsed. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
