//! Trip sweeper - auto-completes stale trips and retries stranded releases
//!
//! Drives the ordinary CompleteTrip path; it holds no state of its own.

use crate::services::orchestrator::TripOrchestrator;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub completed: usize,
    pub failed: usize,
    pub releases_recovered: usize,
}

pub struct TripSweeper {
    orchestrator: Arc<TripOrchestrator>,
    interval: Duration,
    dwell: Duration,
}

impl TripSweeper {
    pub fn new(orchestrator: Arc<TripOrchestrator>, interval: Duration, dwell: Duration) -> Self {
        Self { orchestrator, interval, dwell }
    }

    /// Tick every `interval` until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;

        info!(interval_secs = %self.interval.as_secs(), dwell_secs = %self.dwell.as_secs(), "trip_sweeper_started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep_once(Utc::now()).await;
                    if report != SweepReport::default() {
                        info!(
                            completed = %report.completed,
                            failed = %report.failed,
                            releases_recovered = %report.releases_recovered,
                            "trip_sweep"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("trip_sweeper_shutdown");
                        return;
                    }
                }
            }
        }
    }

    /// Complete every in-progress trip older than the dwell time as of `now`
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport {
            releases_recovered: self.orchestrator.retry_stranded().await,
            ..SweepReport::default()
        };

        let dwell = chrono::Duration::from_std(self.dwell).unwrap_or_else(|_| chrono::Duration::zero());
        for trip in self.orchestrator.stale_trips(now - dwell) {
            match self.orchestrator.complete_trip(&trip.id).await {
                Ok(_) => {
                    debug!(trip_id = %trip.id, "trip_auto_completed");
                    report.completed += 1;
                }
                Err(e) => {
                    warn!(trip_id = %trip.id, error = %e, "trip_auto_complete_failed");
                    report.failed += 1;
                }
            }
        }
        report
    }
}
