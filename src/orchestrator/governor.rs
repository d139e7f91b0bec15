//! Adaptive concurrency governor.
//!
//! Tracks the worker count and reacts to host back-pressure: every
//! rate-limit hit halves the concurrency ceiling and opens a global
//! cooldown window whose length grows with the streak; clean runs restore
//! the ceiling one slot at a time.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub const MAX_CONCURRENT: usize = 8;
pub const MIN_CONCURRENT: usize = 2;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Cooldown length for the nth consecutive rate limit.
pub fn cooldown_for_streak(streak: u32) -> Duration {
    match streak {
        0 | 1 => Duration::from_secs(15),
        2 | 3 => Duration::from_secs(30),
        _ => Duration::from_secs(60),
    }
}

pub struct ConcurrencyGovernor {
    active_workers: AtomicUsize,
    current_max: AtomicUsize,
    /// Epoch millis until which dispatch is paused; 0 when clear.
    rate_limit_until: AtomicI64,
    consecutive_rate_limits: AtomicU32,
    /// Epoch millis of the last successful download; 0 when none yet.
    last_success: AtomicI64,
    is_recovering: AtomicBool,
}

impl ConcurrencyGovernor {
    pub fn new() -> Self {
        Self {
            active_workers: AtomicUsize::new(0),
            current_max: AtomicUsize::new(MAX_CONCURRENT),
            rate_limit_until: AtomicI64::new(0),
            consecutive_rate_limits: AtomicU32::new(0),
            last_success: AtomicI64::new(0),
            is_recovering: AtomicBool::new(false),
        }
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn current_max(&self) -> usize {
        self.current_max.load(Ordering::SeqCst)
    }

    pub fn has_capacity(&self) -> bool {
        self.active_workers() < self.current_max()
    }

    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn worker_finished(&self) {
        // Saturating: the watchdog may already have reset the counter.
        let _ = self
            .active_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Force the worker count back to zero after an invariant breach.
    pub fn reset_active_workers(&self) {
        self.active_workers.store(0, Ordering::SeqCst);
    }

    pub fn in_cooldown(&self) -> bool {
        now_millis() < self.rate_limit_until.load(Ordering::SeqCst)
    }

    pub fn is_recovering(&self) -> bool {
        self.is_recovering.load(Ordering::SeqCst)
    }

    pub fn set_recovering(&self, recovering: bool) {
        self.is_recovering.store(recovering, Ordering::SeqCst);
    }

    pub fn consecutive_rate_limits(&self) -> u32 {
        self.consecutive_rate_limits.load(Ordering::SeqCst)
    }

    /// Register a rate-limit hit: bump the streak, halve the ceiling (never
    /// below [`MIN_CONCURRENT`]) and open the cooldown window. Returns the
    /// cooldown applied.
    pub fn on_rate_limit(&self) -> Duration {
        let streak = self.consecutive_rate_limits.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self
            .current_max
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |max| {
                Some((max / 2).max(MIN_CONCURRENT))
            });
        let cooldown = cooldown_for_streak(streak);
        self.rate_limit_until
            .store(now_millis() + cooldown.as_millis() as i64, Ordering::SeqCst);
        cooldown
    }

    /// Register a successful download: clear the streak, stamp the success
    /// time and restore one slot of concurrency.
    pub fn on_success(&self) {
        self.consecutive_rate_limits.store(0, Ordering::SeqCst);
        self.last_success.store(now_millis(), Ordering::SeqCst);
        self.ramp_up_one();
    }

    /// Periodic ramp-up: restore one slot when the engine has been clean
    /// for the whole window. Returns true if the ceiling moved.
    pub fn try_ramp_up(&self, window: Duration) -> bool {
        if self.consecutive_rate_limits() != 0 {
            return false;
        }
        let last = self.last_success.load(Ordering::SeqCst);
        if last == 0 || now_millis() - last > window.as_millis() as i64 {
            return false;
        }
        self.ramp_up_one()
    }

    fn ramp_up_one(&self) -> bool {
        self.current_max
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |max| {
                (max < MAX_CONCURRENT).then_some(max + 1)
            })
            .is_ok()
    }
}

impl Default for ConcurrencyGovernor {
    fn default() -> Self {
        Self::new()
    }
}
