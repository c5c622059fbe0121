//! Rolling-window limiter for key-set fetches.
//!
//! Counts fetches started within the trailing window. Verification traffic
//! never touches this; only cache misses that would reach the key-set
//! endpoint do, so a flood of tokens with unknown `kid` values cannot turn
//! into a flood of upstream requests.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Allows at most `limit` acquisitions per rolling `window`.
#[derive(Debug)]
pub struct FetchRateLimiter {
    limit: usize,
    window: Duration,
    started: Mutex<VecDeque<Instant>>,
}

impl FetchRateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Self {
            limit,
            window,
            started: Mutex::new(VecDeque::with_capacity(limit.min(64))),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    /// Record one fetch if the budget allows it.
    ///
    /// Returns `Err(retry_after)` when the window is full.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut started = self.started.lock();

        while let Some(oldest) = started.front() {
            if now.duration_since(*oldest) >= self.window {
                started.pop_front();
            } else {
                break;
            }
        }

        if started.len() < self.limit {
            started.push_back(now);
            return Ok(());
        }

        let retry_after = started
            .front()
            .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(self.window);
        Err(retry_after)
    }
}
