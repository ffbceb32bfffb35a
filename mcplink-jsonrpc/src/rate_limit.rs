use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("Rate limit exceeded")]
pub struct RateLimited {
    pub key: String,
}

#[derive(Debug)]
struct Window {
    start: Instant,
    count: u32,
}

#[derive(Debug)]
struct Windows {
    by_key: HashMap<String, Window>,
    last_sweep: Instant,
}

/// Fixed-window admission control, counted separately per key.
///
/// At most `capacity` calls per key are admitted in any one window.  The window for a key starts
/// at the first call after the previous window elapsed, not on a global clock.  Keys whose window
/// has elapsed are forgotten, at most once per window, so callers may key on untrusted input.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    window: Duration,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            windows: Mutex::new(Windows {
                by_key: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Convenience for the common "N per second" configuration
    pub fn per_second(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(1))
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count one call against `key`, failing if the key has used up its window.
    pub fn require_allowance(&self, key: &str) -> Result<(), RateLimited> {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if now.duration_since(windows.last_sweep) >= self.window {
            let period = self.window;
            let before = windows.by_key.len();
            windows
                .by_key
                .retain(|_, window| now.duration_since(window.start) < period);
            windows.last_sweep = now;

            let evicted = before - windows.by_key.len();
            if evicted > 0 {
                tracing::trace!(evicted, "Forgot elapsed rate limit windows");
            }
        }

        let window = windows.by_key.entry(key.to_string()).or_insert(Window {
            start: now,
            count: 0,
        });

        if now.duration_since(window.start) >= self.window {
            window.start = now;
            window.count = 0;
        }

        if window.count >= self.capacity {
            tracing::trace!(key, capacity = self.capacity, "Rate limit exceeded");
            return Err(RateLimited {
                key: key.to_string(),
            });
        }

        window.count += 1;
        Ok(())
    }

    pub fn is_allowed(&self, key: &str) -> bool {
        self.require_allowance(key).is_ok()
    }

    /// Number of keys with a window still being tracked
    pub fn tracked_keys(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .by_key
            .len()
    }
}
