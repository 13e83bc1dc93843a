//! Rate limiter seam consulted before every replay call.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Client-side request limiter shared with the rest of the application.
///
/// The coordinator only asks; accounting is entirely the limiter's business.
pub trait RateLimiter: Send + Sync {
    /// Take a slot for `key`, or refuse.
    fn try_acquire(&self, key: &str) -> bool;
}

/// Limiter used when the application supplies none.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl RateLimiter for AllowAll {
    fn try_acquire(&self, _key: &str) -> bool {
        true
    }
}

/// At most `max_requests` per key within any `window`.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Requests still available for `key` right now.
    pub fn remaining(&self, key: &str) -> usize {
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let used = match hits.get_mut(key) {
            Some(queue) => {
                prune(queue, now, self.window);
                queue.len()
            }
            None => 0,
        };
        if used == 0 {
            hits.remove(key);
        }
        self.max_requests.saturating_sub(used)
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        // Keys with no hits left in the window are forgotten.
        hits.retain(|_, queue| {
            prune(queue, now, self.window);
            !queue.is_empty()
        });

        if self.max_requests == 0 {
            return false;
        }
        let queue = hits.entry(key.to_string()).or_default();
        if queue.len() >= self.max_requests {
            return false;
        }
        queue.push_back(now);
        true
    }
}

fn prune(queue: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = queue.front() {
        if now.duration_since(*oldest) >= window {
            queue.pop_front();
        } else {
            break;
        }
    }
}
