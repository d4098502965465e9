//! Offline marker of an endpoint
//!
//! The marker is swapped atomically, never locked. Absence of a marker means
//! the endpoint is online. A marker is "actual" while `now < since + backoff`;
//! calls fail fast while it is actual.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;

/// Minimal backoff and the budget of read-only calls
pub const FAST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct OfflineCause {
    pub since: Instant,
    pub backoff: Duration,
    pub cause: String,
}

impl OfflineCause {
    pub fn is_actual_at(&self, now: Instant) -> bool {
        now < self.since + self.backoff
    }

    pub fn is_actual(&self) -> bool {
        self.is_actual_at(Instant::now())
    }

    /// Time left until the endpoint is probed again
    pub fn remaining_at(&self, now: Instant) -> Duration {
        (self.since + self.backoff).saturating_duration_since(now)
    }
}

pub struct OfflineMarker {
    state: ArcSwapOption<OfflineCause>,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl OfflineMarker {
    pub fn new(min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            state: ArcSwapOption::empty(),
            min_backoff,
            max_backoff: max_backoff.max(min_backoff),
        }
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn current(&self) -> Option<Arc<OfflineCause>> {
        self.state.load_full()
    }

    pub fn is_online(&self) -> bool {
        self.state.load().is_none()
    }

    /// The marker if it still forbids calls at `now`
    pub fn actual_at(&self, now: Instant) -> Option<Arc<OfflineCause>> {
        self.current().filter(|c| c.is_actual_at(now))
    }

    /// Record a network-level failure. Returns true on the online to offline edge.
    ///
    /// Backoff doubles when the previous marker has expired and holds while it
    /// is still actual, so concurrent failures of in-flight calls never shrink it.
    pub fn record_failure_at(&self, cause: &str, now: Instant) -> bool {
        let min = self.min_backoff;
        let max = self.max_backoff;
        let previous = self.state.rcu(|old| {
            let backoff = match old {
                Some(old) if old.is_actual_at(now) => old.backoff,
                Some(old) => (old.backoff * 2).min(max),
                None => min,
            };
            Some(Arc::new(OfflineCause {
                since: now,
                backoff,
                cause: cause.to_string(),
            }))
        });
        previous.is_none()
    }

    pub fn record_failure(&self, cause: &str) -> bool {
        self.record_failure_at(cause, Instant::now())
    }

    /// Clear the marker. Returns true on the offline to online edge.
    pub fn record_success(&self) -> bool {
        self.state.swap(None).is_some()
    }
}
