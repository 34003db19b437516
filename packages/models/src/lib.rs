#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Shared job, status, and API types for the notes mirror.
//!
//! These types are serialized to JSON for the REST API and map directly
//! onto the `import_jobs` history table. They are kept separate from the
//! database crate so the importer and server can evolve independently of
//! the persistence layer.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Lifecycle state of an import job.
///
/// Transitions are monotonic: `Downloading` → `Importing` → `Completed`,
/// except `Failed`, which is reachable from either non-terminal state and
/// is terminal.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    /// Discovering and downloading the dataset archives.
    Downloading,
    /// Bulk-loading extracted payloads into the store.
    Importing,
    /// All files loaded successfully.
    Completed,
    /// The job stopped with an error (including abort and interruption).
    Failed,
}

impl JobStatus {
    /// Whether this status counts against the single-active-job invariant.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Downloading | Self::Importing)
    }

    /// Whether the job has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One row of the `import_jobs` history table, as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    /// Surrogate row id.
    pub id: i64,
    /// Externally visible job identifier (UUID v4).
    pub job_id: String,
    /// When the job was created.
    pub started_at: DateTime<Utc>,
    /// When the bulk-load phase started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Failure reason, set only on `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Logical date of the dataset actually imported, distinct from
    /// `started_at`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_date: Option<NaiveDate>,
    /// Number of archives discovered for the dataset date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_files: Option<i32>,
    /// Index of the file currently being downloaded or loaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file_index: Option<i32>,
    /// Number of files fully bulk-loaded so far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_processed: Option<i32>,
    /// Comma-joined archive names in discovery order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_names: Option<String>,
    /// Download progress of the current file (0-100).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_percentage: Option<i32>,
    /// Formatted download speed, e.g. `(3.2 MB/s)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_speed: Option<String>,
    /// Whether the current file was served from the on-disk cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_cached: Option<bool>,
    /// Size in bytes of the current file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    /// Elapsed download time in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_duration: Option<i32>,
    /// Expected total row count, computed before the load starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<i64>,
    /// Cumulative rows loaded so far, updated live during the load.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_processed: Option<i64>,
    /// Elapsed import time in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_duration: Option<i32>,
}

/// Response body for `POST /imports`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedJob {
    /// Human-readable confirmation.
    pub message: String,
    /// Identifier of the new job.
    pub job_id: String,
}

/// Query parameters for `POST /imports`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateImportParams {
    /// Test-mode truncation: keep only the header plus the first N data
    /// rows of every extracted payload.
    pub limit: Option<u64>,
}

/// Scheduler status as returned by `GET /imports/scheduler`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    /// Whether the scheduler is enabled at all.
    pub enabled: bool,
    /// Tick interval in seconds.
    pub interval_seconds: u64,
    /// When the scheduler last compared remote and local dates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    /// When the next tick is expected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    /// `data_date` of the most recent completed job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_import_date: Option<NaiveDate>,
}

/// RFC 7807 problem response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    /// Problem type URI.
    #[serde(rename = "type")]
    pub problem_type: String,
    /// Short human-readable summary.
    pub title: String,
    /// HTTP status code.
    pub status: u16,
    /// Occurrence-specific detail.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub detail: String,
}

impl Problem {
    /// Builds a problem body for the given status code.
    #[must_use]
    pub fn new(status: u16, title: &str, detail: &str) -> Self {
        Self {
            problem_type: format!("https://httpstatuses.com/{status}"),
            title: title.to_string(),
            status,
            detail: detail.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strum() {
        assert_eq!(JobStatus::Downloading.to_string(), "downloading");
        assert_eq!(
            "importing".parse::<JobStatus>().unwrap(),
            JobStatus::Importing
        );
        assert_eq!(JobStatus::Failed.as_ref(), "failed");
    }

    #[test]
    fn active_and_terminal_partition_the_states() {
        assert!(JobStatus::Downloading.is_active());
        assert!(JobStatus::Importing.is_active());
        assert!(!JobStatus::Completed.is_active());
        assert!(!JobStatus::Failed.is_active());

        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Downloading.is_terminal());
    }

    #[test]
    fn problem_fills_type_uri_from_status() {
        let p = Problem::new(409, "Conflict", "Import already in progress");
        assert_eq!(p.problem_type, "https://httpstatuses.com/409");
        assert_eq!(p.status, 409);
    }
}
