//! Batch orchestration engine.
//!
//! Owns the track state machine, the scheduling loop, the adaptive
//! concurrency governor, the watchdog and crash recovery. Every state
//! transition in the system goes through [`BatchManager::transition`],
//! which serializes decisions under one mutex and silently drops anything
//! the transition table forbids.

mod actions;
mod dispatcher;
mod governor;
mod manager;
mod watchdog;

pub use actions::{ActionKind, ActionResponse};
pub use dispatcher::Dispatcher;
pub use governor::{cooldown_for_streak, ConcurrencyGovernor, MAX_CONCURRENT, MIN_CONCURRENT};
pub use manager::BatchManager;
pub use watchdog::{RampUpTask, Watchdog};

use std::time::Duration;

/// Download attempts per track before it fails for good.
pub const MAX_RETRIES: i64 = 3;

/// Concurrent mapper lookups during the matching phase.
pub const MATCH_CONCURRENCY: usize = 3;

/// Pause between dispatching consecutive workers.
pub const REQUEST_SPACING: Duration = Duration::from_millis(250);

/// Dispatcher sleep while the global cooldown is open.
pub const COOLDOWN_POLL: Duration = Duration::from_secs(5);

/// Dispatcher sleep while at capacity or recovering.
pub const CAPACITY_POLL: Duration = Duration::from_millis(500);

/// Dispatcher sleep when the queue is empty.
pub const IDLE_POLL: Duration = Duration::from_secs(1);

/// How many upcoming queued tracks get a stream prefetch per dispatch.
pub const PREFETCH_LOOKAHEAD: usize = 5;

/// Watchdog scan period.
pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(60);

/// A track with no progress for this long is considered stuck.
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(90);

/// Ramp-up task period.
pub const RAMP_UP_PERIOD: Duration = Duration::from_secs(30);

/// A success within this window is required before ramping up.
pub const RAMP_UP_WINDOW: Duration = Duration::from_secs(60);
