//! Environment-derived importer settings.

use std::path::PathBuf;
use std::time::Duration;

/// Default base URL of the Community Notes public data bucket.
pub const DEFAULT_BASE_URL: &str = "https://ton.twimg.com/birdwatch-public-data";

/// Default number of days to walk back when discovering the newest
/// published date.
pub const DEFAULT_LOOKBACK_DAYS: u32 = 7;

/// Default scheduler tick interval.
pub const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 3600;

/// Importer settings, read once at startup.
#[derive(Debug, Clone)]
pub struct ImporterConfig {
    /// Directory for cached archives and extracted payloads. Must also be
    /// readable by the Postgres server process, since loading uses
    /// server-side `COPY`.
    pub data_dir: PathBuf,
    /// Base URL of the published dataset.
    pub base_url: String,
    /// Discovery lookback window in days.
    pub lookback_days: u32,
    /// Whether the background scheduler runs at all.
    pub scheduler_enabled: bool,
    /// Scheduler tick interval.
    pub scheduler_interval: Duration,
}

impl ImporterConfig {
    /// Builds the configuration from environment variables, falling back
    /// to defaults for anything unset or unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "/home/data".to_string());

        let base_url = std::env::var("NOTES_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let lookback_days = std::env::var("LOOKBACK_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_LOOKBACK_DAYS);

        let scheduler_enabled = std::env::var("SCHEDULER_ENABLED")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(true);

        let scheduler_interval_secs = std::env::var("SCHEDULER_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SCHEDULER_INTERVAL_SECS);

        Self {
            data_dir: PathBuf::from(data_dir),
            base_url,
            lookback_days,
            scheduler_enabled,
            scheduler_interval: Duration::from_secs(scheduler_interval_secs),
        }
    }
}
