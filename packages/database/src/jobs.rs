//! The job store: every query that reads or mutates `import_jobs`.
//!
//! One row per import attempt, never deleted. The single-active invariant
//! is enforced here, in the database, with an atomic
//! `INSERT ... WHERE NOT EXISTS` backed by a partial unique index over
//! active statuses — there is no in-memory "current job" pointer, so a
//! restart can never disagree with the table about what is running.

use chrono::NaiveDate;
use moosicbox_json_utils::database::ToValue as _;
use notes_mirror_models::{ImportJob, JobStatus};
use switchy_database::{Database, DatabaseValue};

use crate::DbError;

/// Columns selected for every full job read, in table order.
const JOB_COLUMNS: &str = "id, job_id, started_at, import_started_at, completed_at, status, \
     error_message, data_date::TEXT AS data_date, total_files, current_file_index, \
     files_processed, file_names, download_percentage, download_speed, download_cached, \
     file_size, download_duration, total_rows, rows_processed, import_duration";

fn utc(naive: chrono::NaiveDateTime) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_naive_utc_and_offset(naive, chrono::Utc)
}

fn job_from_row(row: &switchy_database::Row) -> Result<ImportJob, DbError> {
    let status_str: String = row.to_value("status").map_err(|e| DbError::Conversion {
        message: format!("Failed to read job status: {e}"),
    })?;
    let status: JobStatus = status_str.parse().map_err(|_| DbError::Conversion {
        message: format!("Unknown job status: {status_str}"),
    })?;

    let started_at_naive: chrono::NaiveDateTime =
        row.to_value("started_at").map_err(|e| DbError::Conversion {
            message: format!("Failed to read started_at: {e}"),
        })?;

    let import_started_at: Option<chrono::NaiveDateTime> =
        row.to_value("import_started_at").unwrap_or(None);
    let completed_at: Option<chrono::NaiveDateTime> = row.to_value("completed_at").unwrap_or(None);

    let data_date: Option<String> = row.to_value("data_date").unwrap_or(None);
    let data_date = data_date.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok());

    Ok(ImportJob {
        id: row.to_value("id").unwrap_or(0),
        job_id: row.to_value("job_id").unwrap_or_default(),
        started_at: utc(started_at_naive),
        import_started_at: import_started_at.map(utc),
        completed_at: completed_at.map(utc),
        status,
        error_message: row.to_value("error_message").unwrap_or(None),
        data_date,
        total_files: row.to_value("total_files").unwrap_or(None),
        current_file_index: row.to_value("current_file_index").unwrap_or(None),
        files_processed: row.to_value("files_processed").unwrap_or(None),
        file_names: row.to_value("file_names").unwrap_or(None),
        download_percentage: row.to_value("download_percentage").unwrap_or(None),
        download_speed: row.to_value("download_speed").unwrap_or(None),
        download_cached: row.to_value("download_cached").unwrap_or(None),
        file_size: row.to_value("file_size").unwrap_or(None),
        download_duration: row.to_value("download_duration").unwrap_or(None),
        total_rows: row.to_value("total_rows").unwrap_or(None),
        rows_processed: row.to_value("rows_processed").unwrap_or(None),
        import_duration: row.to_value("import_duration").unwrap_or(None),
    })
}

/// Whether a database error message describes a unique-constraint
/// violation, in any of Postgres' phrasings.
fn is_unique_violation(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("duplicate key") || message.contains("unique constraint")
}

/// Creates a new job in `downloading` state, unless another job is
/// currently active.
///
/// Returns the new job id, or `None` when an active job refused the
/// creation. The `WHERE NOT EXISTS` guard handles the common case; two
/// inserts racing past it at once are serialized by the partial unique
/// index, and the loser's violation is reported as `None` rather than
/// an error.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn create_job(db: &dyn Database) -> Result<Option<String>, DbError> {
    let job_id = uuid::Uuid::new_v4().to_string();

    let rows = match db
        .query_raw_params(
            "INSERT INTO import_jobs (job_id, status, download_percentage, rows_processed)
             SELECT $1, 'downloading', 0, 0
             WHERE NOT EXISTS (
                 SELECT 1 FROM import_jobs WHERE status IN ('downloading', 'importing')
             )
             RETURNING job_id",
            &[DatabaseValue::String(job_id)],
        )
        .await
    {
        Ok(rows) => rows,
        Err(e) if is_unique_violation(&e.to_string()) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match rows.first() {
        Some(row) => {
            let id: String = row.to_value("job_id").map_err(|e| DbError::Conversion {
                message: format!("Failed to read created job id: {e}"),
            })?;
            Ok(Some(id))
        }
        None => Ok(None),
    }
}

/// Fetches a single job by its external id.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_job(db: &dyn Database, job_id: &str) -> Result<Option<ImportJob>, DbError> {
    let rows = db
        .query_raw_params(
            &format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE job_id = $1"),
            &[DatabaseValue::String(job_id.to_string())],
        )
        .await?;

    rows.first().map(job_from_row).transpose()
}

/// Returns recent job history, newest first.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn list_jobs(db: &dyn Database, limit: u32) -> Result<Vec<ImportJob>, DbError> {
    let rows = db
        .query_raw_params(
            &format!(
                "SELECT {JOB_COLUMNS} FROM import_jobs ORDER BY started_at DESC LIMIT {limit}"
            ),
            &[],
        )
        .await?;

    rows.iter().map(job_from_row).collect()
}

/// Returns the most recent job (active or not), if any exist.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn current_job(db: &dyn Database) -> Result<Option<ImportJob>, DbError> {
    let rows = db
        .query_raw_params(
            &format!("SELECT {JOB_COLUMNS} FROM import_jobs ORDER BY started_at DESC LIMIT 1"),
            &[],
        )
        .await?;

    rows.first().map(job_from_row).transpose()
}

/// Returns just the status of a job. Used as the cooperative abort
/// checkpoint probe, so it deliberately reads only one column.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn job_status(db: &dyn Database, job_id: &str) -> Result<Option<JobStatus>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT status FROM import_jobs WHERE job_id = $1",
            &[DatabaseValue::String(job_id.to_string())],
        )
        .await?;

    let Some(row) = rows.first() else {
        return Ok(None);
    };

    let status_str: String = row.to_value("status").map_err(|e| DbError::Conversion {
        message: format!("Failed to read job status: {e}"),
    })?;
    let status = status_str.parse().map_err(|_| DbError::Conversion {
        message: format!("Unknown job status: {status_str}"),
    })?;

    Ok(Some(status))
}

/// Transitions a job to `failed` with the given reason.
///
/// Does not overwrite an existing failure: a job already in a terminal
/// state is left untouched, so an abort reason recorded by the user is
/// never clobbered by the orchestrator's own error afterwards.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn mark_failed(db: &dyn Database, job_id: &str, message: &str) -> Result<(), DbError> {
    db.exec_raw_params(
        "UPDATE import_jobs
         SET status = 'failed', error_message = $1, completed_at = NOW()
         WHERE job_id = $2 AND status IN ('downloading', 'importing')",
        &[
            DatabaseValue::String(message.to_string()),
            DatabaseValue::String(job_id.to_string()),
        ],
    )
    .await?;

    Ok(())
}

/// Requests cancellation of a job.
///
/// Only succeeds while the job is still active; returns `false` for
/// unknown ids and for jobs already in a terminal state, which the API
/// surfaces as "not found".
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn abort_job(db: &dyn Database, job_id: &str) -> Result<bool, DbError> {
    let affected = db
        .exec_raw_params(
            "UPDATE import_jobs
             SET status = 'failed', error_message = 'Aborted by user', completed_at = NOW()
             WHERE job_id = $1 AND status IN ('downloading', 'importing')",
            &[DatabaseValue::String(job_id.to_string())],
        )
        .await?;

    Ok(affected > 0)
}

/// Fails any job left in an active state by a previous process.
///
/// Called once at startup, before the server accepts requests. A job
/// found `downloading` or `importing` here means the process died
/// mid-run; the distinct "Interrupted" reason keeps that visible.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn fail_interrupted_jobs(db: &dyn Database) -> Result<u64, DbError> {
    let affected = db
        .exec_raw_params(
            "UPDATE import_jobs
             SET status = 'failed', error_message = 'Interrupted', completed_at = NOW()
             WHERE status IN ('downloading', 'importing')",
            &[],
        )
        .await?;

    if affected > 0 {
        log::info!("Marked {affected} interrupted import job(s) as failed");
    }

    Ok(affected)
}

/// Returns the `data_date` of the most recent completed job.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn last_import_date(db: &dyn Database) -> Result<Option<NaiveDate>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT MAX(data_date)::TEXT AS last_date
             FROM import_jobs WHERE status = 'completed'",
            &[],
        )
        .await?;

    let Some(row) = rows.first() else {
        return Ok(None);
    };

    let date: Option<String> = row.to_value("last_date").unwrap_or(None);
    Ok(date.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()))
}

/// Records the discovered file list at the start of the download phase.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn set_discovered_files(
    db: &dyn Database,
    job_id: &str,
    total_files: i32,
    file_names: &str,
) -> Result<(), DbError> {
    db.exec_raw_params(
        "UPDATE import_jobs
         SET total_files = $1, current_file_index = 0, file_names = $2
         WHERE job_id = $3",
        &[
            DatabaseValue::Int32(total_files),
            DatabaseValue::String(file_names.to_string()),
            DatabaseValue::String(job_id.to_string()),
        ],
    )
    .await?;

    Ok(())
}

/// Records a per-file download milestone (index, size, cache flag).
///
/// For a cache hit the caller passes `cached = true` and the percentage is
/// forced to 100 since no transfer will happen.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn set_file_milestone(
    db: &dyn Database,
    job_id: &str,
    file_index: i32,
    file_size: i64,
    cached: bool,
) -> Result<(), DbError> {
    if cached {
        db.exec_raw_params(
            "UPDATE import_jobs
             SET current_file_index = $1, file_size = $2, download_cached = TRUE,
                 download_percentage = 100
             WHERE job_id = $3",
            &[
                DatabaseValue::Int32(file_index),
                DatabaseValue::Int64(file_size),
                DatabaseValue::String(job_id.to_string()),
            ],
        )
        .await?;
    } else {
        db.exec_raw_params(
            "UPDATE import_jobs
             SET current_file_index = $1, file_size = $2, download_cached = FALSE
             WHERE job_id = $3",
            &[
                DatabaseValue::Int32(file_index),
                DatabaseValue::Int64(file_size),
                DatabaseValue::String(job_id.to_string()),
            ],
        )
        .await?;
    }

    Ok(())
}

/// Writes a throttled download progress observation.
///
/// `download_duration` is computed server-side from `started_at` so the
/// wall clock lives in exactly one place.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn set_download_progress(
    db: &dyn Database,
    job_id: &str,
    percentage: i32,
    speed: &str,
    file_size: i64,
    total_files: i32,
    file_index: i32,
) -> Result<(), DbError> {
    db.exec_raw_params(
        "UPDATE import_jobs
         SET download_percentage = $1, download_speed = $2,
             download_duration = EXTRACT(EPOCH FROM (NOW() - started_at))::INTEGER,
             file_size = $3, total_files = $4, current_file_index = $5
         WHERE job_id = $6",
        &[
            DatabaseValue::Int32(percentage),
            DatabaseValue::String(speed.to_string()),
            DatabaseValue::Int64(file_size),
            DatabaseValue::Int32(total_files),
            DatabaseValue::Int32(file_index),
            DatabaseValue::String(job_id.to_string()),
        ],
    )
    .await?;

    Ok(())
}

/// Transitions a job from `downloading` to `importing`.
///
/// Records the expected row count (the ahead-of-time denominator for the
/// live `rows_processed` numerator) and stamps `import_started_at`.
/// Guarded on the current status, so a job aborted after its downloads
/// finished can never be resurrected into `importing`; returns whether
/// the transition happened.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn begin_import_phase(
    db: &dyn Database,
    job_id: &str,
    expected_rows: i64,
    total_size: i64,
    file_names: &str,
) -> Result<bool, DbError> {
    let affected = db
        .exec_raw_params(
            "UPDATE import_jobs
             SET status = 'importing', download_percentage = 100, total_rows = $1,
                 file_size = $2, file_names = $3, files_processed = 0,
                 import_started_at = NOW()
             WHERE job_id = $4 AND status = 'downloading'",
            &[
                DatabaseValue::Int64(expected_rows),
                DatabaseValue::Int64(total_size),
                DatabaseValue::String(file_names.to_string()),
                DatabaseValue::String(job_id.to_string()),
            ],
        )
        .await?;

    Ok(affected > 0)
}

/// Points the job at the file currently being bulk-loaded.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn set_current_load_file(
    db: &dyn Database,
    job_id: &str,
    file_index: i32,
) -> Result<(), DbError> {
    db.exec_raw_params(
        "UPDATE import_jobs SET current_file_index = $1 WHERE job_id = $2",
        &[
            DatabaseValue::Int32(file_index),
            DatabaseValue::String(job_id.to_string()),
        ],
    )
    .await?;

    Ok(())
}

/// Writes a live `rows_processed` observation from the load sampler.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn set_load_progress(
    db: &dyn Database,
    job_id: &str,
    rows_processed: i64,
) -> Result<(), DbError> {
    db.exec_raw_params(
        "UPDATE import_jobs
         SET rows_processed = $1,
             import_duration = EXTRACT(EPOCH FROM (NOW() - import_started_at))::INTEGER
         WHERE job_id = $2",
        &[
            DatabaseValue::Int64(rows_processed),
            DatabaseValue::String(job_id.to_string()),
        ],
    )
    .await?;

    Ok(())
}

/// Records a fully loaded file and the new cumulative row baseline.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn set_file_loaded(
    db: &dyn Database,
    job_id: &str,
    files_processed: i32,
    rows_processed: i64,
) -> Result<(), DbError> {
    db.exec_raw_params(
        "UPDATE import_jobs SET files_processed = $1, rows_processed = $2 WHERE job_id = $3",
        &[
            DatabaseValue::Int32(files_processed),
            DatabaseValue::Int64(rows_processed),
            DatabaseValue::String(job_id.to_string()),
        ],
    )
    .await?;

    Ok(())
}

/// Reads the in-flight `tuples_processed` counter from Postgres' own
/// `COPY` progress view. Returns 0 when no `COPY` is running.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn copy_in_flight_rows(db: &dyn Database) -> Result<i64, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT COALESCE(tuples_processed, 0) AS tuples_processed
             FROM pg_stat_progress_copy LIMIT 1",
            &[],
        )
        .await?;

    let Some(row) = rows.first() else {
        return Ok(0);
    };

    Ok(row.to_value("tuples_processed").unwrap_or(0))
}

/// Truncates the `notes` table ahead of a full re-load.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn truncate_notes(db: &dyn Database) -> Result<(), DbError> {
    db.exec_raw("TRUNCATE notes").await?;
    Ok(())
}

/// Bulk-loads one extracted TSV payload into `notes` with server-side
/// `COPY`. The path must be visible to the Postgres server process.
///
/// # Errors
///
/// Returns [`DbError`] if the `COPY` fails.
pub async fn copy_notes_from(db: &dyn Database, tsv_path: &str) -> Result<(), DbError> {
    db.exec_raw(&format!(
        "COPY notes FROM '{tsv_path}' WITH (FORMAT csv, DELIMITER E'\\t', HEADER true)"
    ))
    .await?;

    Ok(())
}

/// Returns the current total row count of `notes`.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn count_notes(db: &dyn Database) -> Result<i64, DbError> {
    let rows = db
        .query_raw_params("SELECT COUNT(*) AS count FROM notes", &[])
        .await?;

    let Some(row) = rows.first() else {
        return Ok(0);
    };

    Ok(row.to_value("count").unwrap_or(0))
}

/// Transitions a job to `completed` with its final counters.
///
/// Guarded on `importing` so a terminal state is never overwritten,
/// even if an abort lands between the last checkpoint and completion.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn complete_job(
    db: &dyn Database,
    job_id: &str,
    total_rows: i64,
    data_date: NaiveDate,
) -> Result<(), DbError> {
    db.exec_raw_params(
        "UPDATE import_jobs
         SET status = 'completed', total_rows = $1, rows_processed = $1,
             data_date = $2::DATE, completed_at = NOW(),
             import_duration = EXTRACT(EPOCH FROM (NOW() - import_started_at))::INTEGER
         WHERE job_id = $3 AND status = 'importing'",
        &[
            DatabaseValue::Int64(total_rows),
            DatabaseValue::String(data_date.format("%Y-%m-%d").to_string()),
            DatabaseValue::String(job_id.to_string()),
        ],
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_is_recognized_from_postgres_messages() {
        assert!(is_unique_violation(
            "duplicate key value violates unique constraint \"idx_import_jobs_single_active\""
        ));
        assert!(is_unique_violation(
            "Database error: ERROR: duplicate key value violates unique constraint"
        ));
    }

    #[test]
    fn other_errors_are_not_mistaken_for_unique_violations() {
        assert!(!is_unique_violation("connection refused"));
        assert!(!is_unique_violation(
            "null value in column \"status\" violates not-null constraint"
        ));
    }
}
