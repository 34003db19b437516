//! Background scheduler: periodically imports newer data automatically.
//!
//! Each tick reuses the read-only discovery probes to find the newest
//! remote date and compares it against the `data_date` of the most
//! recent completed job. Both inputs and the decision are idempotent —
//! repeating a tick with unchanged data is a no-op. Job creation goes
//! through the same store path as the HTTP trigger, so the single-active
//! invariant holds no matter who asks first.

use std::sync::RwLock;

use chrono::{DateTime, NaiveDate, Utc};
use notes_mirror_database::jobs;
use notes_mirror_models::SchedulerStatus;

use crate::discovery::{self, DiscoveryError};
use crate::orchestrator::{ImportContext, spawn_import};

/// Process-lifetime scheduler observability state.
///
/// One task writes on tick; any request task may read for status
/// reporting, hence the read/write lock.
pub struct SchedulerState {
    enabled: bool,
    interval_seconds: u64,
    times: RwLock<SchedulerTimes>,
}

#[derive(Default)]
struct SchedulerTimes {
    last_check: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
}

impl SchedulerState {
    /// Creates scheduler state from the importer configuration.
    #[must_use]
    pub fn new(config: &crate::ImporterConfig) -> Self {
        Self {
            enabled: config.scheduler_enabled,
            interval_seconds: config.scheduler_interval.as_secs(),
            times: RwLock::new(SchedulerTimes::default()),
        }
    }

    /// Whether the scheduler runs at all.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    fn record_sleep(&self, now: DateTime<Utc>) {
        let mut times = self
            .times
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        times.next_run = now.checked_add_signed(chrono::Duration::seconds(
            i64::try_from(self.interval_seconds).unwrap_or(i64::MAX),
        ));
    }

    fn record_check(&self, now: DateTime<Utc>) {
        let mut times = self
            .times
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        times.last_check = Some(now);
    }

    /// Builds the status snapshot for the scheduler endpoint.
    #[must_use]
    pub fn status(&self, last_import_date: Option<NaiveDate>) -> SchedulerStatus {
        let times = self
            .times
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        SchedulerStatus {
            enabled: self.enabled,
            interval_seconds: self.interval_seconds,
            last_check: times.last_check,
            next_run: times.next_run,
            last_import_date,
        }
    }
}

/// Runs the scheduler loop until the process exits.
///
/// Returns immediately when scheduling is disabled. Errors inside a tick
/// are logged and never end the loop.
pub async fn run_scheduler(ctx: ImportContext, state: std::sync::Arc<SchedulerState>) {
    if !state.enabled() {
        log::info!("Scheduler disabled");
        return;
    }

    let interval = ctx.config.scheduler_interval;
    log::info!("Scheduler running every {}s", interval.as_secs());

    loop {
        state.record_sleep(Utc::now());
        tokio::time::sleep(interval).await;

        state.record_check(Utc::now());
        tick(&ctx).await;
    }
}

/// One scheduler tick: probe, compare, maybe trigger.
async fn tick(ctx: &ImportContext) {
    let remote_date = match discovery::find_latest_date(
        &ctx.client,
        &ctx.config.base_url,
        ctx.config.lookback_days,
    )
    .await
    {
        Ok(date) => date,
        Err(DiscoveryError::NoDataFound { lookback_days }) => {
            log::info!("Scheduler: no remote data within {lookback_days} days");
            return;
        }
        Err(e) => {
            log::warn!("Scheduler discovery failed: {e}");
            return;
        }
    };

    let last_imported = match jobs::last_import_date(ctx.db.as_ref()).await {
        Ok(date) => date,
        Err(e) => {
            log::warn!("Scheduler failed to read last import date: {e}");
            return;
        }
    };

    if !should_trigger(remote_date, last_imported) {
        log::debug!("Scheduler: {remote_date} already imported, nothing to do");
        return;
    }

    match jobs::create_job(ctx.db.as_ref()).await {
        Ok(Some(job_id)) => {
            log::info!("Scheduler triggered import {job_id} for {remote_date}");
            spawn_import(ctx.clone(), job_id, None);
        }
        Ok(None) => {
            log::info!("Scheduler: an import is already active, skipping");
        }
        Err(e) => {
            log::warn!("Scheduler failed to create job: {e}");
        }
    }
}

/// Triggers only when the remote date is strictly newer than the last
/// successfully imported one. Never having imported counts as older
/// than everything.
fn should_trigger(remote: NaiveDate, last_imported: Option<NaiveDate>) -> bool {
    last_imported.is_none_or(|last| remote > last)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn triggers_when_nothing_was_ever_imported() {
        assert!(should_trigger(date("2024-01-10"), None));
    }

    #[test]
    fn triggers_only_on_strictly_newer_remote_data() {
        assert!(should_trigger(
            date("2024-01-10"),
            Some(date("2024-01-09"))
        ));
        assert!(!should_trigger(
            date("2024-01-10"),
            Some(date("2024-01-10"))
        ));
        assert!(!should_trigger(
            date("2024-01-10"),
            Some(date("2024-01-11"))
        ));
    }

    #[test]
    fn status_reflects_recorded_timestamps() {
        let config = crate::ImporterConfig {
            data_dir: std::path::PathBuf::from("/tmp"),
            base_url: "https://example.com".to_string(),
            lookback_days: 7,
            scheduler_enabled: true,
            scheduler_interval: std::time::Duration::from_secs(3600),
        };
        let state = SchedulerState::new(&config);

        let status = state.status(None);
        assert!(status.enabled);
        assert_eq!(status.interval_seconds, 3600);
        assert!(status.last_check.is_none());
        assert!(status.next_run.is_none());

        let now = Utc::now();
        state.record_sleep(now);
        state.record_check(now);

        let status = state.status(Some(date("2024-01-10")));
        assert_eq!(status.last_check, Some(now));
        assert_eq!(
            status.next_run,
            now.checked_add_signed(chrono::Duration::seconds(3600))
        );
        assert_eq!(status.last_import_date, Some(date("2024-01-10")));
    }
}
