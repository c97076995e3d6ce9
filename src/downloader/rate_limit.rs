//! Sliding-window rate limiting
//!
//! Enforces three request ceilings at once (trailing second, minute and
//! hour) for every worker sharing the limiter, plus externally imposed
//! pauses after the server rejects a request with HTTP 429.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::downloader::config::RateCeilings;
use crate::metrics::RateLimiterMetrics;

/// One trailing-window ceiling with its log of granted request instants
#[derive(Debug)]
struct Ceiling {
    limit: usize,
    horizon: Duration,
    granted: VecDeque<Instant>,
}

impl Ceiling {
    fn new(limit: u32, horizon: Duration) -> Self {
        Self {
            limit: limit.max(1) as usize,
            horizon,
            granted: VecDeque::with_capacity(limit.min(4096) as usize),
        }
    }

    fn purge(&mut self, now: Instant) {
        while let Some(&oldest) = self.granted.front() {
            if now.duration_since(oldest) >= self.horizon {
                self.granted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until a slot frees up, or zero when one is free now
    fn wait_time(&self, now: Instant) -> Duration {
        if self.granted.len() < self.limit {
            return Duration::ZERO;
        }
        // Saturated: the slot frees when the oldest grant that must expire leaves the horizon
        let blocking = self.granted[self.granted.len() - self.limit];
        (blocking + self.horizon).saturating_duration_since(now)
    }
}

#[derive(Debug)]
struct LimiterState {
    ceilings: [Ceiling; 3],
    paused_until: Option<Instant>,
}

/// Rate limiter enforcing per-second, per-minute and per-hour ceilings
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// Create a limiter from the three ceilings
    pub fn new(ceilings: RateCeilings) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                ceilings: [
                    Ceiling::new(ceilings.per_second, Duration::from_secs(1)),
                    Ceiling::new(ceilings.per_minute, Duration::from_secs(60)),
                    Ceiling::new(ceilings.per_hour, Duration::from_secs(3600)),
                ],
                paused_until: None,
            }),
        }
    }

    /// Wait until a request may proceed, then record it
    ///
    /// The check and the record happen under one lock so concurrent callers
    /// can never both take the last slot. After sleeping the caller re-checks,
    /// since a different ceiling (or another caller) may bind next.
    pub async fn acquire(&self) {
        let mut metrics = RateLimiterMetrics::new();
        metrics.start_acquire();

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();

                let mut wait = match state.paused_until {
                    Some(until) if until > now => until - now,
                    _ => {
                        state.paused_until = None;
                        Duration::ZERO
                    }
                };

                for ceiling in state.ceilings.iter_mut() {
                    ceiling.purge(now);
                    wait = wait.max(ceiling.wait_time(now));
                }

                if wait.is_zero() {
                    for ceiling in state.ceilings.iter_mut() {
                        ceiling.granted.push_back(now);
                    }
                    metrics.record_acquired();
                    return;
                }
                wait
            };

            debug!(wait_ms = wait.as_millis(), "Rate limit reached, waiting for a free slot");
            sleep(wait).await;
        }
    }

    /// Hold every caller for `duration`, e.g. after a server-side 429
    pub async fn pause_for(&self, duration: Duration) {
        let mut state = self.state.lock().await;
        let until = Instant::now() + duration;
        state.paused_until = Some(match state.paused_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        debug!(pause_ms = duration.as_millis(), "Rate limiter paused by server signal");
    }

    /// Requests granted in the trailing `horizon` of the given ceiling index
    #[cfg(test)]
    async fn granted_in(&self, ceiling: usize) -> usize {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.ceilings[ceiling].purge(now);
        state.ceilings[ceiling].granted.len()
    }
}
