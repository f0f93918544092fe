//! Windowed rate limiter for a single price source.
//!
//! Keeps the admission instants of the most recent `requests_per_window`
//! grants. A request is admitted when fewer than that many grants fall inside
//! the trailing window; otherwise it must wait until the oldest grant ages out.
//! A burst therefore gets `requests_per_window` immediate slots and the next
//! caller waits for the window that started with the burst to end.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceEndpointConfig;
use crate::errors::IngestError;
use crate::models::PriceSource;

/// Outcome of a non-blocking admission attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Admission {
    /// A slot was taken.
    Granted,
    /// The window is full; a slot frees up after this long.
    Wait(Duration),
}

#[derive(Debug, Default)]
struct Window {
    grants: VecDeque<Instant>,
}

impl Window {
    fn evict_expired(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.grants.front() {
            if now.duration_since(*oldest) >= window {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-source admission control.
///
/// Eviction, the capacity check and the grant happen under one lock, so
/// callers racing at a window boundary never share a slot.
pub struct RateLimiter {
    source: PriceSource,
    requests_per_window: usize,
    window_duration: Duration,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(source: PriceSource, requests_per_window: u32, window_duration: Duration) -> Self {
        Self {
            source,
            requests_per_window: requests_per_window.max(1) as usize,
            window_duration,
            window: Mutex::new(Window::default()),
        }
    }

    pub fn from_config(config: &ServiceEndpointConfig) -> Self {
        Self::new(
            config.name,
            config.requests_per_window,
            config.window_duration,
        )
    }

    /// Lock the window, recovering from poison if necessary.
    ///
    /// The window only holds instants, so a poisoned guard is still consistent.
    fn lock_window(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(|poisoned| {
            warn!("Rate limiter mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Take a slot if one is free, otherwise report how long until one frees up.
    pub fn reserve(&self) -> Admission {
        let now = Instant::now();
        let mut window = self.lock_window();
        window.evict_expired(now, self.window_duration);

        if window.grants.len() < self.requests_per_window {
            window.grants.push_back(now);
            return Admission::Granted;
        }

        let wait = window
            .grants
            .front()
            .and_then(|oldest| oldest.checked_add(self.window_duration))
            .map(|frees_at| frees_at.saturating_duration_since(now))
            .unwrap_or(self.window_duration);
        Admission::Wait(wait)
    }

    /// Try to take a slot without waiting.
    ///
    /// Returns true if a slot was taken, false if rate limited.
    pub fn try_acquire(&self) -> bool {
        matches!(self.reserve(), Admission::Granted)
    }

    /// Wait until a slot is available, then take it.
    ///
    /// The lock is released before sleeping. Returns `Cancelled` if the token
    /// fires while waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), IngestError> {
        loop {
            let wait = match self.reserve() {
                Admission::Granted => {
                    debug!("Rate limiter: acquired slot for '{}'", self.source);
                    return Ok(());
                }
                Admission::Wait(wait) => wait,
            };

            debug!(
                "Rate limiter: waiting {:?} for source '{}'",
                wait, self.source
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Slots still free in the current window.
    pub fn remaining(&self) -> u32 {
        let now = Instant::now();
        let mut window = self.lock_window();
        window.evict_expired(now, self.window_duration);
        self.requests_per_window.saturating_sub(window.grants.len()) as u32
    }

    /// Forget all grants.
    pub fn reset(&self) {
        self.lock_window().grants.clear();
        debug!("Rate limiter: reset window for '{}'", self.source);
    }
}
