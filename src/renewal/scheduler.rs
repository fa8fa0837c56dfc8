use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, TimeZone, Utc};
use log::{debug, error, info};

use crate::core::shutdown::ShutdownSignal;
use crate::renewal::orchestrator::{CycleOutcome, RenewalOrchestrator};

/// Wakes the orchestrator once at startup, daily at the renewal hour (UTC)
/// and, when configured, every `check_interval`.
pub struct RenewalScheduler {
    orchestrator: Arc<RenewalOrchestrator>,
    shutdown: ShutdownSignal,
    renewal_hour: u32,
    check_interval: Option<Duration>,
}

impl RenewalScheduler {
    pub fn new(orchestrator: Arc<RenewalOrchestrator>, shutdown: ShutdownSignal) -> Self {
        let renewal_hour = orchestrator.config().renewal_hour;
        let check_interval = orchestrator.config().check_interval;
        Self {
            orchestrator,
            shutdown,
            renewal_hour,
            check_interval,
        }
    }

    /// Runs until shutdown. An attempt in progress is awaited; it aborts on
    /// its own at the next poll boundary.
    pub async fn run(self) {
        info!(
            "[renewal] scheduler started: daily at {:02}:00 UTC{}",
            self.renewal_hour,
            match self.check_interval {
                Some(interval) => format!(", every {} min", interval.as_secs() / 60),
                None => String::new(),
            }
        );

        loop {
            self.tick().await;
            if self.shutdown.is_triggered() {
                break;
            }

            let now = Utc::now();
            let wake = next_wake(now, self.renewal_hour, self.check_interval);
            let delay = (wake - now).to_std().unwrap_or(Duration::ZERO);
            debug!("[renewal] next check at {wake}");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.triggered() => break,
            }
        }
        info!("[renewal] scheduler stopped");
    }

    async fn tick(&self) {
        let orchestrator = Arc::clone(&self.orchestrator);
        match tokio::task::spawn_blocking(move || orchestrator.run_cycle()).await {
            Ok(CycleOutcome::Skipped) => debug!("[renewal] tick skipped"),
            Ok(outcome) => debug!("[renewal] tick finished: {outcome:?}"),
            Err(err) => error!("[renewal] renewal task join error: {err}"),
        }
    }
}

/// First `hour:00` UTC strictly after `now`.
pub fn next_check_at(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let today = now.date_naive();
    let at = |date: chrono::NaiveDate| {
        date.and_hms_opt(hour.min(23), 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive))
    };
    match at(today) {
        Some(candidate) if candidate > now => candidate,
        _ => today
            .checked_add_days(Days::new(1))
            .and_then(at)
            .unwrap_or(now + chrono::Duration::days(1)),
    }
}

/// The earlier of the daily trigger and the fixed interval.
pub fn next_wake(now: DateTime<Utc>, hour: u32, interval: Option<Duration>) -> DateTime<Utc> {
    let daily = next_check_at(now, hour);
    match interval.and_then(|i| chrono::Duration::from_std(i).ok()) {
        Some(interval) => daily.min(now + interval),
        None => daily,
    }
}
