//! Per-handle health tracking and the auto-disable policy.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Health status of one plugin handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Incompatible,
}

/// Two crashes inside this window disable the handle.
pub const CRASH_WINDOW: Duration = Duration::from_secs(60);

/// Consecutive failures before a handle is considered unhealthy.
pub const UNHEALTHY_STREAK: u64 = 5;

/// Rolling statistics for one `(agent, plugin)` handle.
#[derive(Debug, Clone, Default)]
pub struct HandleHealth {
    pub call_count: u64,
    pub failed_call_count: u64,
    pub consecutive_failures: u64,
    pub last_success: Option<DateTime<Utc>>,
    /// Exponentially weighted moving average of call latency.
    pub avg_response_ms: f64,
    /// Compatibility warning surfaced from discovery, if any.
    pub warning: Option<String>,
    incompatible: bool,
    crashes: VecDeque<DateTime<Utc>>,
}

impl HandleHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_incompatible(&mut self) {
        self.incompatible = true;
    }

    pub fn set_warning(&mut self, warning: impl Into<String>) {
        self.warning = Some(warning.into());
    }

    pub fn record_success(&mut self, elapsed_ms: f64) {
        self.call_count += 1;
        self.consecutive_failures = 0;
        self.last_success = Some(Utc::now());
        if self.avg_response_ms == 0.0 {
            self.avg_response_ms = elapsed_ms;
        } else {
            self.avg_response_ms = 0.8 * self.avg_response_ms + 0.2 * elapsed_ms;
        }
    }

    pub fn record_failure(&mut self) {
        self.call_count += 1;
        self.failed_call_count += 1;
        self.consecutive_failures += 1;
    }

    /// Record a crash at `now`. Returns `true` when the crash count in
    /// the window crosses the disable threshold.
    pub fn record_crash(&mut self, now: DateTime<Utc>) -> bool {
        self.record_failure();
        self.crashes.push_back(now);
        let cutoff = now - chrono::Duration::seconds(CRASH_WINDOW.as_secs() as i64);
        while self.crashes.front().is_some_and(|t| *t < cutoff) {
            self.crashes.pop_front();
        }
        self.crashes.len() >= 2
    }

    pub fn status(&self) -> HandleStatus {
        if self.incompatible {
            return HandleStatus::Incompatible;
        }
        if self.consecutive_failures >= UNHEALTHY_STREAK {
            return HandleStatus::Unhealthy;
        }
        if self.call_count >= 4 && self.failed_call_count * 2 > self.call_count {
            return HandleStatus::Degraded;
        }
        HandleStatus::Healthy
    }
}
