//! Sliding-window request budget
//!
//! The limiter keeps the dispatch instants of the current window. A request
//! may go out only while fewer than `budget` dispatches happened in the
//! trailing `window`; otherwise the caller sleeps until the oldest dispatch
//! leaves the window. Work is never dropped, only delayed.
//!
//! The budget can be replaced at any time (e.g. from a provider's rate-limit
//! header); the new value applies to the next acquisition.

use crate::{CollectError, Result};
use reqwest::header::HeaderMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Budget of `requests` per rolling `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub requests: u32,
    pub window: Duration,
}

impl RateBudget {
    pub fn per_hour(requests: u32) -> Self {
        Self {
            requests,
            window: Duration::from_secs(3600),
        }
    }

    /// Workers needed to saturate the budget assuming ~5s responses
    pub fn worker_count(&self) -> usize {
        let slots = (self.window.as_secs_f64() / 5.0).max(1.0);
        ((self.requests as f64 / slots).ceil() as usize).max(1)
    }
}

/// Recomputes the budget from a response
pub trait DynamicRateLimit: Send + Sync {
    fn budget(&self, headers: &HeaderMap) -> Option<RateBudget>;
}

/// Reads a limit header and multiplies it by the number of rotated credentials
#[derive(Debug, Clone)]
pub struct HeaderRateLimit {
    pub header: String,
    pub credentials: u32,
    pub window: Duration,
}

impl HeaderRateLimit {
    pub fn new(credentials: usize) -> Self {
        Self {
            header: "X-RateLimit-Limit".to_string(),
            credentials: credentials.max(1) as u32,
            window: Duration::from_secs(3600),
        }
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = header.into();
        self
    }
}

impl DynamicRateLimit for HeaderRateLimit {
    fn budget(&self, headers: &HeaderMap) -> Option<RateBudget> {
        let limit: u32 = headers
            .get(self.header.as_str())?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()?;
        if limit == 0 {
            return None;
        }
        Some(RateBudget {
            requests: limit.saturating_mul(self.credentials),
            window: self.window,
        })
    }
}

#[derive(Debug)]
struct Window {
    budget: RateBudget,
    issued: VecDeque<Instant>,
}

impl Window {
    /// Take a slot at `now`, or report how long until one frees up
    fn try_acquire(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        while let Some(&oldest) = self.issued.front() {
            if oldest + self.budget.window <= now {
                self.issued.pop_front();
            } else {
                break;
            }
        }

        // An empty budget never frees a slot; poll again after a window.
        if self.budget.requests == 0 {
            return Err(self.budget.window.max(Duration::from_secs(1)));
        }

        if self.issued.len() < self.budget.requests as usize {
            self.issued.push_back(now);
            return Ok(());
        }

        // A shrunk budget may leave more than `requests` entries in the window;
        // the slot frees once enough of them expire.
        let excess = self.issued.len() - self.budget.requests as usize;
        let blocker = self.issued[excess];
        Err((blocker + self.budget.window).saturating_duration_since(now))
    }
}

/// Shared limiter for one connection
#[derive(Debug)]
pub struct RateLimiter {
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(budget: RateBudget) -> Self {
        Self {
            window: Mutex::new(Window {
                budget,
                issued: VecDeque::new(),
            }),
        }
    }

    pub fn budget(&self) -> RateBudget {
        self.lock().map(|w| w.budget).unwrap_or(RateBudget {
            requests: 0,
            window: Duration::ZERO,
        })
    }

    /// Replace the budget; in-window dispatches still count against it
    pub fn update(&self, budget: RateBudget) {
        if budget.requests == 0 {
            return;
        }
        if let Ok(mut window) = self.lock() {
            if window.budget != budget {
                tracing::debug!(
                    requests = budget.requests,
                    window_secs = budget.window.as_secs(),
                    "Rate budget updated"
                );
                window.budget = budget;
            }
        }
    }

    /// Dispatches counted in the trailing window
    pub fn in_window(&self) -> usize {
        self.lock().map(|w| w.issued.len()).unwrap_or(0)
    }

    /// Wait for a slot, or fail with `Cancelled` when the token fires first
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(CollectError::Cancelled);
            }
            let wait = match self.lock()?.try_acquire(Instant::now()) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            tracing::trace!(wait_ms = wait.as_millis() as u64, "Rate budget exhausted");
            tokio::select! {
                _ = cancel.cancelled() => return Err(CollectError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Window>> {
        self.window
            .lock()
            .map_err(|_| CollectError::Other("rate limiter lock poisoned".to_string()))
    }
}
