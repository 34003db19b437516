//! Bulk loading of extracted payloads with live progress sampling.
//!
//! The target table is truncated exactly once per job, before the first
//! file — an import is always a complete replacement of the dataset,
//! never an incremental merge. While a `COPY` is in flight, a sampling
//! task polls Postgres' own `pg_stat_progress_copy` view and publishes
//! baseline-plus-in-flight to the job row, so `rows_processed` moves
//! between per-file commits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use notes_mirror_database::{DbError, jobs};
use switchy_database::Database;
use tokio::sync::oneshot;

use crate::fetch::FileDescriptor;

/// How often the sampler reads the in-flight `COPY` counter.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Result of the load phase.
pub enum LoadOutcome {
    /// All files loaded; final row count of the table.
    Completed {
        /// Total rows in the table after the last file.
        total_rows: i64,
    },
    /// The job was externally failed at a checkpoint; stop quietly.
    Aborted,
}

/// Errors from the bulk-load phase. All fatal to the job; the message
/// carries the underlying store's error text.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Truncate failed before any file was loaded.
    #[error("failed to truncate table: {0}")]
    Truncate(DbError),

    /// A per-file `COPY` failed.
    #[error("failed to import {file_name}: {source}")]
    Copy {
        /// Cache name of the file being loaded.
        file_name: String,
        /// Underlying store error.
        source: DbError,
    },
}

/// Loads every extracted payload, in discovery order, into `notes`.
///
/// Starts the progress sampler once for the whole job and stops it
/// exactly once afterwards — the stop signal is a oneshot consumed by
/// the sampler, so a double signal is unrepresentable.
///
/// # Errors
///
/// Returns [`LoadError`] if the truncate or any `COPY` fails.
pub async fn load_files(
    db: Arc<dyn Database>,
    job_id: &str,
    files: &[FileDescriptor],
) -> Result<LoadOutcome, LoadError> {
    if job_already_failed(db.as_ref(), job_id).await {
        log::info!("Job {job_id} aborted before load phase");
        return Ok(LoadOutcome::Aborted);
    }

    jobs::truncate_notes(db.as_ref())
        .await
        .map_err(LoadError::Truncate)?;

    // Rows committed by fully loaded files; the sampler adds the
    // in-flight COPY counter on top of this baseline.
    let baseline = Arc::new(Mutex::new(0i64));

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let sampler = tokio::spawn(sample_progress(
        Arc::clone(&db),
        job_id.to_string(),
        Arc::clone(&baseline),
        stop_rx,
    ));

    let result = load_sequence(db.as_ref(), job_id, files, &baseline).await;

    let _ = stop_tx.send(());
    let _ = sampler.await;

    result
}

/// The main loading sequence, separated so the sampler is stopped on
/// exactly one path regardless of how the sequence ends.
async fn load_sequence(
    db: &dyn Database,
    job_id: &str,
    files: &[FileDescriptor],
    baseline: &Mutex<i64>,
) -> Result<LoadOutcome, LoadError> {
    let total_files = files.len();

    for (index, file) in files.iter().enumerate() {
        if job_already_failed(db, job_id).await {
            log::info!("Job {job_id} aborted before loading file {index}");
            return Ok(LoadOutcome::Aborted);
        }

        let file_index = i32::try_from(index).unwrap_or(i32::MAX);
        if let Err(e) = jobs::set_current_load_file(db, job_id, file_index).await {
            log::warn!("Failed to record current load file for job {job_id}: {e}");
        }

        let tsv_path = file.tsv_path.display().to_string();
        jobs::copy_notes_from(db, &tsv_path)
            .await
            .map_err(|e| LoadError::Copy {
                file_name: file.file_name.clone(),
                source: e,
            })?;

        // A file-level COPY either fully succeeds or fully fails, so the
        // fresh table count is the new cumulative baseline.
        let count = match jobs::count_notes(db).await {
            Ok(count) => count,
            Err(e) => {
                log::warn!("Failed to count rows after {}: {e}", file.file_name);
                *baseline.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
            }
        };

        *baseline
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = count;

        let files_processed = i32::try_from(index + 1).unwrap_or(i32::MAX);
        if let Err(e) = jobs::set_file_loaded(db, job_id, files_processed, count).await {
            log::warn!("Failed to record loaded file for job {job_id}: {e}");
        }

        log::info!(
            "Loaded {} ({}/{total_files}, {count} rows total)",
            file.file_name,
            index + 1
        );
    }

    let total_rows = *baseline
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    Ok(LoadOutcome::Completed { total_rows })
}

/// Polls the store's in-progress `COPY` introspection and publishes
/// live `rows_processed` observations until the stop signal fires.
///
/// Every write here is cosmetic telemetry: failures are logged and
/// ignored, never allowed to fail the job.
async fn sample_progress(
    db: Arc<dyn Database>,
    job_id: String,
    baseline: Arc<Mutex<i64>>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut last_published = 0i64;

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = interval.tick() => {
                let in_flight = match jobs::copy_in_flight_rows(db.as_ref()).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        log::debug!("COPY progress read failed: {e}");
                        continue;
                    }
                };

                let base = *baseline
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);

                // Between a file's COPY committing and the baseline being
                // bumped, the in-flight counter is already empty. Clamp so
                // rows_processed never moves backwards in that window.
                let total = next_progress_sample(base, in_flight, last_published);
                last_published = total;

                if let Err(e) = jobs::set_load_progress(db.as_ref(), &job_id, total).await {
                    log::debug!("Load progress write failed for job {job_id}: {e}");
                }
            }
        }
    }
}

/// The next `rows_processed` observation: baseline plus the in-flight
/// `COPY` counter, never less than the last published value.
fn next_progress_sample(baseline: i64, in_flight: i64, last_published: i64) -> i64 {
    (baseline + in_flight).max(last_published)
}

async fn job_already_failed(db: &dyn Database, job_id: &str) -> bool {
    match jobs::job_status(db, job_id).await {
        Ok(Some(status)) => status.is_terminal(),
        Ok(None) => false,
        Err(e) => {
            log::warn!("Abort checkpoint read failed for job {job_id}: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_add_in_flight_rows_to_the_baseline() {
        assert_eq!(next_progress_sample(0, 500, 0), 500);
        assert_eq!(next_progress_sample(1000, 250, 1200), 1250);
    }

    #[test]
    fn samples_never_fall_below_the_last_published_value() {
        // A file's COPY just committed: the in-flight counter is empty
        // again but the baseline has not been bumped yet.
        let last = next_progress_sample(1000, 900, 0);
        assert_eq!(last, 1900);
        assert_eq!(next_progress_sample(1000, 0, last), 1900);

        // Once the baseline catches up, samples move forward again.
        assert_eq!(next_progress_sample(1900, 100, last), 2000);
    }
}
