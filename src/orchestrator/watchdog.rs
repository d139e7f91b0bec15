//! Health monitor and concurrency ramp-up tasks.

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::store::TrackStatus;

use super::manager::BatchManager;
use super::{RAMP_UP_PERIOD, RAMP_UP_WINDOW, WATCHDOG_PERIOD, WATCHDOG_TIMEOUT};

/// Periodically requeues tracks whose workers stopped reporting progress,
/// and self-heals the worker counter when it drifts from reality.
pub struct Watchdog {
    manager: Arc<BatchManager>,
}

impl Watchdog {
    pub fn new(manager: Arc<BatchManager>) -> Self {
        Self { manager }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Watchdog starting ({}s period)", WATCHDOG_PERIOD.as_secs());
        let mut interval = tokio::time::interval(WATCHDOG_PERIOD);
        interval.tick().await; // immediate first tick is not a scan
        loop {
            tokio::select! {
                _ = interval.tick() => self.scan().await,
                _ = shutdown.cancelled() => {
                    info!("Watchdog shutting down");
                    break;
                }
            }
        }
    }

    /// One sweep: requeue every stalled entry, then check the counter
    /// invariant.
    pub async fn scan(&self) {
        let now = Instant::now();
        let stalled: Vec<String> = {
            let entries = self.manager.watchdog_entries.lock().unwrap();
            entries
                .iter()
                .filter(|(_, last)| now.duration_since(**last) > WATCHDOG_TIMEOUT)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for track_id in stalled {
            warn!("Watchdog requeuing stalled track {}", track_id);
            match self
                .manager
                .transition(&track_id, TrackStatus::Queued, |t| {
                    t.bytes_downloaded = 0;
                    t.total_bytes = 0;
                    t.error_code = Some("stalled download".to_string());
                })
                .await
            {
                Ok(_) => {}
                Err(e) => error!("Watchdog requeue of {} failed: {:#}", track_id, e),
            }
            self.manager.watchdog_entries.lock().unwrap().remove(&track_id);
        }

        let governor = self.manager.governor();
        let map_empty = self.manager.watchdog_entries.lock().unwrap().is_empty();
        if governor.active_workers() > 0 && map_empty {
            error!(
                "Invariant breach: {} active workers but no watchdog entries; resetting",
                governor.active_workers()
            );
            governor.reset_active_workers();
        }
    }
}

/// Restores one slot of concurrency per period after a clean interval.
pub struct RampUpTask {
    manager: Arc<BatchManager>,
}

impl RampUpTask {
    pub fn new(manager: Arc<BatchManager>) -> Self {
        Self { manager }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(RAMP_UP_PERIOD);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.manager.governor().try_ramp_up(RAMP_UP_WINDOW) {
                        info!(
                            "Ramped concurrency up to {}",
                            self.manager.governor().current_max()
                        );
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }
}
