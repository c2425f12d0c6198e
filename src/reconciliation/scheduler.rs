// Reconciliation scheduler - periodic matcher runs
//
// - Keeps, per gateway, the end of the last window it reconciled and works
//   through every closed window since then, oldest first
// - A failed window stops that gateway's catch-up; it is retried next cycle
// - At most `max_catch_up` windows per gateway per cycle; a backlog makes the
//   next cycle start right away
// - Waits a settle delay after each boundary so late statement lines land
// - Gateways run concurrently; the run lease keeps a window exclusive even
//   when several instances run the scheduler

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::engine::Reconciler;
use crate::error::{AppError, ReconError};
use crate::ledger::models::Gateway;

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub window: Duration,
    pub settle_delay: Duration,
    pub gateways: Vec<Gateway>,
    /// Windows one gateway may run in a single cycle
    pub max_catch_up: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            window: Duration::hours(1),
            settle_delay: Duration::minutes(10),
            gateways: Gateway::all(),
            max_catch_up: 24,
        }
    }
}

pub struct ReconciliationScheduler {
    config: ScheduleConfig,
    reconciler: Arc<Reconciler>,
    /// End of the last window reconciled, per gateway
    progress: HashMap<Gateway, DateTime<Utc>>,
}

impl ReconciliationScheduler {
    pub fn new(config: ScheduleConfig, reconciler: Arc<Reconciler>) -> Self {
        Self {
            config,
            reconciler,
            progress: HashMap::new(),
        }
    }

    /// Start the scheduler (runs in background)
    pub fn start(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let backlog = match Self::latest_closed_window(
                    Utc::now(),
                    self.config.window,
                    self.config.settle_delay,
                ) {
                    Some((_, latest_end)) => self.run_cycle(latest_end).await,
                    None => false,
                };
                if backlog {
                    continue;
                }

                let wake = Self::next_wake(Utc::now(), self.config.window, self.config.settle_delay);
                let wait = (wake - Utc::now()).to_std().unwrap_or_default();
                info!("⏰ Next reconciliation cycle at {} UTC", wake.format("%H:%M:%S"));
                tokio::time::sleep(wait).await;
            }
        })
    }

    /// Bring every gateway up to `latest_end` as far as this cycle allows.
    /// Returns true when some gateway advanced but is still behind.
    async fn run_cycle(&mut self, latest_end: DateTime<Utc>) -> bool {
        let config = &self.config;
        let reconciler = &self.reconciler;
        let progress = &self.progress;

        let runs = config.gateways.iter().map(|gateway| {
            let gateway = *gateway;
            let known = progress.get(&gateway).copied();
            async move {
                // Without history the gateway starts at the latest window
                let last = match known {
                    Some(last) => last,
                    None => match reconciler.last_completed_window_end(gateway).await {
                        Ok(stored) => stored.unwrap_or(latest_end - config.window),
                        Err(e) => {
                            error!("❌ {} run history unavailable: {}", gateway, e);
                            return (gateway, None, None);
                        }
                    },
                };
                let windows = Self::pending_windows(last, latest_end, config.window, config.max_catch_up);
                let reached = Self::catch_up(reconciler, gateway, &windows).await;
                (gateway, Some(last), reached)
            }
        });
        let results = join_all(runs).await;

        let mut backlog = false;
        for (gateway, last, reached) in results {
            if let Some(end) = reached {
                self.progress.insert(gateway, end);
                backlog |= end < latest_end;
            } else if let Some(last) = last {
                self.progress.insert(gateway, last);
            }
        }
        backlog
    }

    /// Run `windows` in order, stopping at the first one that cannot finish.
    /// Returns the end of the last window that is now reconciled.
    async fn catch_up(
        reconciler: &Reconciler,
        gateway: Gateway,
        windows: &[(DateTime<Utc>, DateTime<Utc>)],
    ) -> Option<DateTime<Utc>> {
        let mut reached = None;
        for &(start, end) in windows {
            match reconciler.reconcile(gateway, start, end).await {
                Ok(report) => {
                    info!(
                        "✓ {} {}..{}: {} new queue items",
                        gateway,
                        start,
                        end,
                        report.items.len()
                    );
                    reached = Some(end);
                }
                Err(AppError::Recon(ReconError::WindowOverlap { .. })) => {
                    warn!("{} window {}..{} already covered by another run", gateway, start, end);
                    reached = Some(end);
                }
                Err(AppError::Recon(ReconError::RunInProgress { .. })) => {
                    info!("{} window {}..{} running elsewhere; retrying later", gateway, start, end);
                    break;
                }
                Err(e) => {
                    error!("❌ {} reconciliation of {}..{} failed: {}", gateway, start, end, e);
                    break;
                }
            }
        }
        reached
    }

    /// Closed windows after `last` up to `latest_end`, oldest first, at most
    /// `max` of them. The first window stretches from `last` to the next
    /// aligned boundary.
    fn pending_windows(
        last: DateTime<Utc>,
        latest_end: DateTime<Utc>,
        window: Duration,
        max: usize,
    ) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let size = window.num_seconds();
        if size <= 0 || last >= latest_end {
            return Vec::new();
        }

        let first_end_secs = (last.timestamp().div_euclid(size) + 1) * size;
        let mut windows = Vec::new();
        let mut start = last;
        let mut end = match Utc.timestamp_opt(first_end_secs, 0).single() {
            Some(end) => end,
            None => return windows,
        };
        while end <= latest_end && windows.len() < max {
            windows.push((start, end));
            start = end;
            end = end + window;
        }
        windows
    }

    /// Latest window of length `window`, aligned to the epoch, whose end is at
    /// least `settle_delay` in the past
    fn latest_closed_window(
        now: DateTime<Utc>,
        window: Duration,
        settle_delay: Duration,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let size = window.num_seconds();
        if size <= 0 {
            return None;
        }
        let cutoff = (now - settle_delay).timestamp();
        let end_secs = cutoff.div_euclid(size) * size;
        let end = Utc.timestamp_opt(end_secs, 0).single()?;
        Some((end - window, end))
    }

    /// Next boundary plus settle delay, strictly after `now`
    fn next_wake(now: DateTime<Utc>, window: Duration, settle_delay: Duration) -> DateTime<Utc> {
        match Self::latest_closed_window(now, window, settle_delay) {
            Some((_, end)) => end + window + settle_delay,
            None => now + Duration::minutes(1),
        }
    }
}
