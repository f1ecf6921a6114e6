//! Per-identity sliding-window rate limiting.
//!
//! Each identity owns an ordered list of admission timestamps. A call is
//! admitted while fewer than `max` timestamps fall inside the trailing
//! window; admitted calls append their timestamp, rejected calls do not.
//! One privileged identity bypasses the window entirely.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Sliding-window admission check keyed by identity.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    name: &'static str,
    window: Duration,
    max: usize,
    privileged: Option<String>,
    windows: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter admitting `max` calls per `window` for each identity.
    pub fn new(name: &'static str, window: Duration, max: usize) -> Self {
        Self {
            name,
            window,
            max,
            privileged: None,
            windows: HashMap::new(),
        }
    }

    /// Exempt `identity` from the limit. Its calls never consume budget.
    pub fn with_privileged(mut self, identity: impl Into<String>) -> Self {
        self.privileged = Some(identity.into());
        self
    }

    /// Admit or reject a call from `identity`.
    pub fn allow(&mut self, identity: &str) -> bool {
        self.allow_at(identity, Instant::now())
    }

    fn allow_at(&mut self, identity: &str, now: Instant) -> bool {
        if self.is_privileged(identity) {
            return true;
        }

        let stamps = self.windows.entry(identity.to_string()).or_default();
        prune(stamps, now, self.window);

        if stamps.len() >= self.max {
            debug!(
                limiter = self.name,
                identity,
                used = stamps.len(),
                max = self.max,
                "Rate limit reached"
            );
            return false;
        }

        stamps.push_back(now);
        true
    }

    /// Calls `identity` may still make in the current window.
    pub fn remaining(&mut self, identity: &str) -> usize {
        if self.is_privileged(identity) {
            return self.max;
        }
        let now = Instant::now();
        match self.windows.get_mut(identity) {
            Some(stamps) => {
                prune(stamps, now, self.window);
                self.max.saturating_sub(stamps.len())
            }
            None => self.max,
        }
    }

    /// Drop identities whose windows have fully drained.
    pub fn prune_idle(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.windows.retain(|_, stamps| {
            prune(stamps, now, window);
            !stamps.is_empty()
        });
    }

    /// Number of identities currently tracked.
    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }

    fn is_privileged(&self, identity: &str) -> bool {
        self.privileged.as_deref() == Some(identity)
    }
}

fn prune(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = stamps.front() {
        if now.duration_since(*oldest) >= window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}
