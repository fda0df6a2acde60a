//! Per-broadcast flow control.
//!
//! A broadcast walks the routing table in passes. The policy decides when a
//! pass has issued enough sends, how long to wait before the next pass, and
//! optionally caps the total number of sends for the whole broadcast.

use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Consecutive throttled passes beyond the first that each add one
/// `min_delay` step to the retry delay.
const MAX_BACKOFF_STEPS: u32 = 8;

pub trait FlowControl: Send {
    /// Clear per-pass counters. Called once at the start of every pass.
    fn reset_pass(&mut self);

    /// Count one issued send. Returns false once the pass ceiling has been
    /// reached; the caller must stop the pass.
    ///
    /// Every call counts exactly one send toward [`FlowControl::total`].
    fn check_qps(&mut self) -> bool;

    /// Sends issued in the current (or just finished) pass.
    fn total(&self) -> u64;

    /// How long to wait before the next pass. Never zero.
    fn delay(&self) -> Duration;

    /// Called once when the broadcast completes, with every user id whose
    /// send was confirmed across all passes.
    fn end(&mut self, successful: &HashSet<String>);

    /// Whether the broadcast-wide send cap has been used up. Once true, the
    /// broadcast stops visiting routes and finishes.
    fn limit_reached(&self) -> bool {
        false
    }

    /// Observed sends per second over the broadcast's lifetime.
    fn qps(&self) -> u64 {
        0
    }
}

/// Flow control parameters, either the server default or a per-broadcast
/// override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSettings {
    /// Maximum sends per pass; `0` disables the ceiling.
    pub limit: u64,
    /// Maximum sends for the whole broadcast; `0` means no cap.
    pub max_total: u64,
    /// Pacing window a pass is expected to fill.
    pub window: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            limit: 0,
            max_total: 0,
            window: Duration::from_secs(1),
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl FlowSettings {
    /// Build a fresh policy instance. Policies are never shared between
    /// broadcasts.
    pub fn build(&self) -> Box<dyn FlowControl> {
        if self.limit == 0 && self.max_total == 0 {
            Box::new(UnlimitedFlowControl::new(self.min_delay))
        } else {
            Box::new(FastFlowControl::new(*self))
        }
    }
}

/// No ceiling: a broadcast finishes in a single pass.
pub struct UnlimitedFlowControl {
    min_delay: Duration,
    pass_total: u64,
}

impl UnlimitedFlowControl {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay: min_delay.max(Duration::from_millis(1)),
            pass_total: 0,
        }
    }
}

impl FlowControl for UnlimitedFlowControl {
    fn reset_pass(&mut self) {
        self.pass_total = 0;
    }

    fn check_qps(&mut self) -> bool {
        self.pass_total += 1;
        true
    }

    fn total(&self) -> u64 {
        self.pass_total
    }

    fn delay(&self) -> Duration {
        self.min_delay
    }

    fn end(&mut self, successful: &HashSet<String>) {
        tracing::debug!(delivered = successful.len(), "unlimited flow control finished");
    }
}

/// Fixed ceiling per pass with load-scaled retry delays.
pub struct FastFlowControl {
    settings: FlowSettings,
    created: Instant,
    pass_started: Instant,
    pass_total: u64,
    overall_total: u64,
    throttled_this_pass: bool,
    consecutive_throttled: u32,
}

impl FastFlowControl {
    pub fn new(settings: FlowSettings) -> Self {
        let now = Instant::now();
        let settings = FlowSettings {
            min_delay: settings.min_delay.max(Duration::from_millis(1)),
            max_delay: settings.max_delay.max(settings.min_delay),
            ..settings
        };
        Self {
            settings,
            created: now,
            pass_started: now,
            pass_total: 0,
            overall_total: 0,
            throttled_this_pass: false,
            consecutive_throttled: 0,
        }
    }

    pub fn overall_total(&self) -> u64 {
        self.overall_total
    }
}

impl FlowControl for FastFlowControl {
    fn reset_pass(&mut self) {
        if self.throttled_this_pass {
            self.consecutive_throttled = self.consecutive_throttled.saturating_add(1);
        } else {
            self.consecutive_throttled = 0;
        }
        self.throttled_this_pass = false;
        self.pass_total = 0;
        self.pass_started = Instant::now();
    }

    fn check_qps(&mut self) -> bool {
        self.pass_total += 1;
        self.overall_total += 1;
        if self.settings.limit > 0 && self.pass_total >= self.settings.limit {
            self.throttled_this_pass = true;
            return false;
        }
        true
    }

    fn total(&self) -> u64 {
        self.pass_total
    }

    /// Whatever is left of the pacing window, floored at `min_delay`, plus
    /// one `min_delay` per consecutive throttled pass before this one,
    /// capped at `max_delay`.
    fn delay(&self) -> Duration {
        let remaining = self.settings.window.saturating_sub(self.pass_started.elapsed());
        let steps = self.consecutive_throttled.min(MAX_BACKOFF_STEPS);
        let delay = remaining.max(self.settings.min_delay) + self.settings.min_delay * steps;
        delay.min(self.settings.max_delay)
    }

    fn end(&mut self, successful: &HashSet<String>) {
        tracing::debug!(
            issued = self.overall_total,
            delivered = successful.len(),
            qps = self.qps(),
            "flow control finished"
        );
    }

    fn limit_reached(&self) -> bool {
        self.settings.max_total > 0 && self.overall_total >= self.settings.max_total
    }

    fn qps(&self) -> u64 {
        let elapsed = self.created.elapsed().as_secs_f64();
        if elapsed <= f64::EPSILON {
            return self.overall_total;
        }
        (self.overall_total as f64 / elapsed) as u64
    }
}
