//! The import job state machine.
//!
//! `downloading → importing → {completed | failed}`; `failed` is
//! reachable from either non-terminal state and is terminal. A job is
//! always a fresh row — there is no reset state. Every fatal error in
//! the background run is caught here, recorded into the job row, and
//! never propagates out of the task.

use std::sync::Arc;

use notes_mirror_database::{DbError, jobs};
use switchy_database::Database;

use crate::config::ImporterConfig;
use crate::discovery::{self, DiscoveryError};
use crate::fetch::{self, FetchError, FetchOutcome, FileDescriptor};
use crate::loader::{self, LoadError, LoadOutcome};

/// Everything a background import run needs. Cheap to clone — the
/// database handle and config are shared, and `reqwest::Client` is an
/// `Arc` internally.
#[derive(Clone)]
pub struct ImportContext {
    /// Shared database handle.
    pub db: Arc<dyn Database>,
    /// Shared HTTP client.
    pub client: reqwest::Client,
    /// Importer settings.
    pub config: Arc<ImporterConfig>,
}

/// Errors that end an import run. The display text is what lands in the
/// job row's `error_message`.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// Discovery found nothing to import.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Download or extraction failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Truncate or bulk load failed.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// A required job-state transition failed.
    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

/// Dispatches an import run as an independent background task.
///
/// The caller returns to its client as soon as the job row exists; the
/// run owns the job's lifecycle from here to a terminal state.
pub fn spawn_import(ctx: ImportContext, job_id: String, limit: Option<u64>) {
    tokio::spawn(async move {
        run_import(&ctx, &job_id, limit).await;
    });
}

/// Runs one import job to a terminal state.
///
/// This is the only error boundary of the background run: any failure
/// from the phases below is recorded through [`jobs::mark_failed`],
/// which deliberately refuses to overwrite a failure already recorded
/// by an external abort.
pub async fn run_import(ctx: &ImportContext, job_id: &str, limit: Option<u64>) {
    match run_phases(ctx, job_id, limit).await {
        Ok(Some(total_rows)) => {
            log::info!("Import {job_id} completed ({total_rows} rows)");
        }
        Ok(None) => {
            log::info!("Import {job_id} stopped at an abort checkpoint");
        }
        Err(e) => {
            log::error!("Import {job_id} failed: {e}");
            if let Err(e) = jobs::mark_failed(ctx.db.as_ref(), job_id, &e.to_string()).await {
                log::warn!("Failed to record failure for job {job_id}: {e}");
            }
        }
    }
}

/// Phase 1 and phase 2, in sequence. Returns the final row count, or
/// `None` when the job was aborted at a checkpoint (the abort already
/// recorded its own failure reason).
async fn run_phases(
    ctx: &ImportContext,
    job_id: &str,
    limit: Option<u64>,
) -> Result<Option<i64>, ImportError> {
    let db = ctx.db.as_ref();

    // Phase 1: discovery, then per-file download and extraction.
    let date = discovery::find_latest_date(&ctx.client, &ctx.config.base_url, ctx.config.lookback_days)
        .await?;
    let total_files = discovery::count_files(&ctx.client, &ctx.config.base_url, date).await?;

    let file_names: Vec<String> = (0..total_files)
        .map(|i| discovery::cache_file_name(date, i))
        .collect();
    let file_names = file_names.join(",");

    let total_files_i32 = i32::try_from(total_files).unwrap_or(i32::MAX);
    if let Err(e) = jobs::set_discovered_files(db, job_id, total_files_i32, &file_names).await {
        log::warn!("Failed to record discovered files for job {job_id}: {e}");
    }

    let files =
        match fetch::fetch_all(db, &ctx.client, &ctx.config, job_id, date, total_files).await? {
            FetchOutcome::Fetched(files) => files,
            FetchOutcome::Aborted => return Ok(None),
        };

    if let Some(limit) = limit.filter(|l| *l > 0) {
        for file in &files {
            log::info!("Truncating {} to {limit} rows", file.tsv_path.display());
            if let Err(e) = fetch::truncate_tsv(&file.tsv_path, limit) {
                log::warn!("Failed to truncate {}: {e}", file.tsv_path.display());
            }
        }
    }

    // Phase 2: expected totals up front, then the bulk load.
    let expected_rows = expected_total_rows(&files);
    let total_size: i64 = files.iter().map(|f| f.file_size).sum();

    if !jobs::begin_import_phase(db, job_id, expected_rows, total_size, &file_names).await? {
        log::info!("Import {job_id} aborted before the load phase could start");
        return Ok(None);
    }

    let total_rows = match loader::load_files(Arc::clone(&ctx.db), job_id, &files).await? {
        LoadOutcome::Completed { total_rows } => total_rows,
        LoadOutcome::Aborted => return Ok(None),
    };

    jobs::complete_job(db, job_id, total_rows, date).await?;

    fetch::cleanup_old_files(&ctx.config.data_dir, &date.to_string());

    Ok(Some(total_rows))
}

/// Sums per-file data-row counts before the load, giving observers an
/// ahead-of-time denominator for the live `rows_processed` numerator.
fn expected_total_rows(files: &[FileDescriptor]) -> i64 {
    files
        .iter()
        .filter_map(|f| match fetch::count_tsv_rows(&f.tsv_path) {
            Ok(rows) => Some(rows),
            Err(e) => {
                log::warn!("Failed to count rows in {}: {e}", f.tsv_path.display());
                None
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("notes_mirror_orchestrator_{name}"));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn descriptor(dir: &std::path::Path, name: &str, rows: usize) -> FileDescriptor {
        let tsv_path = dir.join(name);
        let mut contents = String::from("noteId\tsummary\n");
        for i in 0..rows {
            contents.push_str(&format!("{i}\tnote {i}\n"));
        }
        fs::write(&tsv_path, contents).unwrap();

        FileDescriptor {
            zip_path: tsv_path.with_extension("zip"),
            tsv_path,
            file_name: name.to_string(),
            file_size: 0,
        }
    }

    #[test]
    fn expected_rows_sum_per_file_counts_minus_headers() {
        let dir = test_dir("expected_rows");
        let files = vec![
            descriptor(&dir, "a.tsv", 100),
            descriptor(&dir, "b.tsv", 200),
            descriptor(&dir, "c.tsv", 50),
        ];

        assert_eq!(expected_total_rows(&files), 350);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unreadable_files_are_skipped_in_the_expected_total() {
        let dir = test_dir("expected_rows_missing");
        let mut files = vec![descriptor(&dir, "a.tsv", 10)];
        files.push(FileDescriptor {
            zip_path: dir.join("gone.zip"),
            tsv_path: dir.join("gone.tsv"),
            file_name: "gone.tsv".to_string(),
            file_size: 0,
        });

        assert_eq!(expected_total_rows(&files), 10);

        let _ = fs::remove_dir_all(&dir);
    }
}
