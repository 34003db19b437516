//! Archive download, caching, extraction, and payload shaping.
//!
//! Each discovered file index is materialized locally: either reused
//! from the on-disk cache (no network transfer) or streamed to disk with
//! throttled progress writes against the job row. The single expected
//! TSV entry is then extracted next to the archive. There is no partial
//! resume — a failed transfer deletes the partial file and fails the
//! whole job; dataset files are modest in size, so restarting a file is
//! cheaper than a resume protocol.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use futures::StreamExt as _;
use notes_mirror_database::jobs;
use switchy_database::Database;
use tokio::io::AsyncWriteExt as _;

use crate::config::ImporterConfig;
use crate::discovery::{archive_url, cache_file_name, payload_name};
use crate::progress::ProgressTracker;

/// A materialized dataset file, produced by the fetch phase and consumed
/// by the bulk loader. Ephemeral — discarded when the job finishes.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    /// Local archive path.
    pub zip_path: PathBuf,
    /// Local extracted TSV path.
    pub tsv_path: PathBuf,
    /// Cache file name (date-prefixed).
    pub file_name: String,
    /// Archive size in bytes.
    pub file_size: i64,
}

/// Result of the fetch phase.
pub enum FetchOutcome {
    /// All files materialized and extracted, in discovery order.
    Fetched(Vec<FileDescriptor>),
    /// The job was externally failed at a checkpoint; stop quietly.
    Aborted,
}

/// Errors from downloading or extracting archives.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// HTTP request error.
    #[error("failed to download {url}: {source}")]
    Http {
        /// Request URL.
        url: String,
        /// Underlying client error.
        source: reqwest::Error,
    },

    /// Non-success HTTP status.
    #[error("failed to download {url}: status {status}")]
    HttpStatus {
        /// Request URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// Local filesystem error.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path that caused the error.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Corrupt or unreadable archive.
    #[error("failed to read archive {path}: {source}")]
    Zip {
        /// Archive path.
        path: String,
        /// Underlying zip error.
        source: zip::result::ZipError,
    },

    /// The expected payload entry is not in the archive.
    #[error("{entry} not found in {archive}")]
    EntryMissing {
        /// Expected entry name.
        entry: String,
        /// Archive path.
        archive: String,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> FetchError {
    FetchError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Materializes and extracts every file of a discovered dataset.
///
/// Files are processed strictly in ascending index order. Before each
/// file the job status is re-read as a cooperative abort checkpoint.
/// Progress and milestone writes against the job row are best-effort:
/// failures are logged and never abort an otherwise-healthy job.
///
/// # Errors
///
/// Returns [`FetchError`] on any transfer, filesystem, or extraction
/// failure — all fatal to the job.
pub async fn fetch_all(
    db: &dyn Database,
    client: &reqwest::Client,
    config: &ImporterConfig,
    job_id: &str,
    date: NaiveDate,
    total_files: usize,
) -> Result<FetchOutcome, FetchError> {
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .map_err(|e| io_err(&config.data_dir, e))?;

    let mut files = Vec::with_capacity(total_files);

    for index in 0..total_files {
        if job_already_failed(db, job_id).await {
            log::info!("Job {job_id} aborted before file {index}, stopping download");
            return Ok(FetchOutcome::Aborted);
        }

        let file_name = cache_file_name(date, index);
        let zip_path = config.data_dir.join(&file_name);

        let (file_size, cached) = if let Ok(meta) = tokio::fs::metadata(&zip_path).await {
            log::info!("File already cached: {}", zip_path.display());
            #[allow(clippy::cast_possible_wrap)]
            let size = meta.len() as i64;
            (size, true)
        } else {
            let url = archive_url(&config.base_url, date, index);
            let size = download_file(
                db,
                client,
                &url,
                &zip_path,
                job_id,
                total_files,
                index,
            )
            .await?;
            (size, false)
        };

        if let Err(e) = jobs::set_file_milestone(
            db,
            job_id,
            i32::try_from(index).unwrap_or(i32::MAX),
            file_size,
            cached,
        )
        .await
        {
            log::warn!("Failed to record file milestone for job {job_id}: {e}");
        }

        let tsv_path = extract_payload(&zip_path, index)?;

        files.push(FileDescriptor {
            zip_path,
            tsv_path,
            file_name,
            file_size,
        });
    }

    Ok(FetchOutcome::Fetched(files))
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

/// Streams one archive to disk, driving throttled progress writes.
///
/// Returns the transferred byte count. On any error the partial file is
/// deleted so a later attempt never mistakes it for a cached copy.
async fn download_file(
    db: &dyn Database,
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    job_id: &str,
    total_files: usize,
    index: usize,
) -> Result<i64, FetchError> {
    log::info!("Downloading {url} -> {}", dest.display());

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| FetchError::Http {
            url: url.to_string(),
            source: e,
        })?;

    if !response.status().is_success() {
        return Err(FetchError::HttpStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let total_bytes = response.content_length();
    let mut tracker = ProgressTracker::new(total_bytes);

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| io_err(dest, e))?;

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(FetchError::Http {
                    url: url.to_string(),
                    source: e,
                });
            }
        };

        if let Err(e) = file.write_all(&chunk).await {
            drop(file);
            let _ = tokio::fs::remove_file(dest).await;
            return Err(io_err(dest, e));
        }

        downloaded += chunk.len() as u64;

        if let Some(update) = tracker.record(chunk.len()) {
            #[allow(clippy::cast_possible_wrap)]
            let result = jobs::set_download_progress(
                db,
                job_id,
                update.percentage,
                &update.speed,
                update.total_bytes as i64,
                i32::try_from(total_files).unwrap_or(i32::MAX),
                i32::try_from(index).unwrap_or(i32::MAX),
            )
            .await;
            if let Err(e) = result {
                log::warn!("Progress write failed for job {job_id}: {e}");
            }
        }
    }

    file.flush().await.map_err(|e| io_err(dest, e))?;
    log::info!("Downloaded {} ({downloaded} bytes)", dest.display());

    #[allow(clippy::cast_possible_wrap)]
    Ok(downloaded as i64)
}

/// Extracts the expected TSV entry from an archive into a sibling file.
///
/// Each archive is expected to contain exactly one payload named after
/// its file index; anything else is a fatal, non-retryable error.
///
/// # Errors
///
/// Returns [`FetchError`] if the archive is unreadable or the entry is
/// missing.
pub fn extract_payload(zip_path: &Path, index: usize) -> Result<PathBuf, FetchError> {
    let entry_name = payload_name(index);
    let tsv_path = zip_path.with_extension("tsv");

    let file = std::fs::File::open(zip_path).map_err(|e| io_err(zip_path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| FetchError::Zip {
        path: zip_path.display().to_string(),
        source: e,
    })?;

    let mut entry = match archive.by_name(&entry_name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(FetchError::EntryMissing {
                entry: entry_name,
                archive: zip_path.display().to_string(),
            });
        }
        Err(e) => {
            return Err(FetchError::Zip {
                path: zip_path.display().to_string(),
                source: e,
            });
        }
    };

    let mut out = std::fs::File::create(&tsv_path).map_err(|e| io_err(&tsv_path, e))?;
    std::io::copy(&mut entry, &mut out).map_err(|e| io_err(&tsv_path, e))?;

    log::info!("Extracted {}", tsv_path.display());
    Ok(tsv_path)
}

/// Rewrites a TSV in place to contain only the header plus the first
/// `max_rows` data rows.
///
/// Test-mode only: bounds the cost of a verification run without
/// changing any other code path. Writes to a temp file and renames so
/// an interrupted truncation never leaves a half-written payload.
///
/// # Errors
///
/// Returns an I/O error if the payload cannot be read or rewritten.
pub fn truncate_tsv(tsv_path: &Path, max_rows: u64) -> Result<(), FetchError> {
    if max_rows == 0 {
        return Ok(());
    }

    let file = std::fs::File::open(tsv_path).map_err(|e| io_err(tsv_path, e))?;
    let mut reader = BufReader::new(file);

    let tmp_path = tsv_path.with_extension("tsv.tmp");
    let mut out = std::fs::File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;

    // Header line plus max_rows data lines.
    let mut line = Vec::new();
    for _ in 0..=max_rows {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .map_err(|e| io_err(tsv_path, e))?;
        if n == 0 {
            break;
        }
        out.write_all(&line).map_err(|e| io_err(&tmp_path, e))?;
    }

    drop(out);
    std::fs::rename(&tmp_path, tsv_path).map_err(|e| io_err(tsv_path, e))?;
    Ok(())
}

/// Counts the data rows of a TSV payload (newlines minus the header).
///
/// # Errors
///
/// Returns an I/O error if the payload cannot be read.
pub fn count_tsv_rows(tsv_path: &Path) -> Result<i64, FetchError> {
    let mut file = std::fs::File::open(tsv_path).map_err(|e| io_err(tsv_path, e))?;

    let mut buf = [0u8; 32 * 1024];
    let mut count: i64 = 0;
    loop {
        let n = file.read(&mut buf).map_err(|e| io_err(tsv_path, e))?;
        if n == 0 {
            break;
        }
        #[allow(clippy::cast_possible_wrap)]
        let newlines = buf[..n].iter().filter(|&&b| b == b'\n').count() as i64;
        count += newlines;
    }

    Ok((count - 1).max(0))
}

/// Removes cached files whose names do not start with `keep_prefix`.
///
/// Called after a successful import with the dataset date as the prefix,
/// bounding disk growth to roughly one dataset's worth of archives.
/// Best-effort throughout — failures are logged, never fatal.
pub fn cleanup_old_files(data_dir: &Path, keep_prefix: &str) {
    let entries = match std::fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Failed to read data directory {}: {e}", data_dir.display());
            return;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if !name.starts_with(keep_prefix) {
            let path = entry.path();
            match std::fs::remove_file(&path) {
                Ok(()) => log::info!("Removed old file {}", path.display()),
                Err(e) => log::warn!("Failed to remove old file {}: {e}", path.display()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use zip::write::SimpleFileOptions;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("notes_mirror_fetch_{name}"));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_archive(path: &Path, entry: &str, contents: &[u8]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file(entry, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn extracts_the_expected_entry() {
        let dir = test_dir("extract");
        let zip_path = dir.join("2024-01-10-notes-00000.zip");
        write_archive(&zip_path, "notes-00000.tsv", b"noteId\tsummary\n1\thello\n");

        let tsv_path = extract_payload(&zip_path, 0).unwrap();
        assert_eq!(tsv_path, dir.join("2024-01-10-notes-00000.tsv"));
        assert_eq!(
            fs::read_to_string(&tsv_path).unwrap(),
            "noteId\tsummary\n1\thello\n"
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_entry_is_fatal() {
        let dir = test_dir("missing_entry");
        let zip_path = dir.join("2024-01-10-notes-00003.zip");
        write_archive(&zip_path, "unexpected.tsv", b"data\n");

        let err = extract_payload(&zip_path, 3).unwrap_err();
        assert!(matches!(
            err,
            FetchError::EntryMissing { entry, .. } if entry == "notes-00003.tsv"
        ));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_archive_is_fatal() {
        let dir = test_dir("corrupt");
        let zip_path = dir.join("bad.zip");
        fs::write(&zip_path, b"this is not a zip file").unwrap();

        assert!(matches!(
            extract_payload(&zip_path, 0),
            Err(FetchError::Zip { .. })
        ));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn truncation_keeps_header_plus_n_rows() {
        let dir = test_dir("truncate");
        let tsv = dir.join("notes.tsv");

        let mut contents = String::from("noteId\tsummary\n");
        for i in 0..1000 {
            contents.push_str(&format!("{i}\trow {i}\n"));
        }
        fs::write(&tsv, &contents).unwrap();

        truncate_tsv(&tsv, 10).unwrap();

        let truncated = fs::read_to_string(&tsv).unwrap();
        let lines: Vec<&str> = truncated.lines().collect();
        assert_eq!(lines.len(), 11);
        assert_eq!(lines[0], "noteId\tsummary");
        assert_eq!(lines[10], "9\trow 9");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn truncation_is_a_noop_when_the_file_is_already_short() {
        let dir = test_dir("truncate_short");
        let tsv = dir.join("notes.tsv");
        fs::write(&tsv, "noteId\tsummary\n1\ta\n2\tb\n").unwrap();

        truncate_tsv(&tsv, 100).unwrap();
        assert_eq!(
            fs::read_to_string(&tsv).unwrap(),
            "noteId\tsummary\n1\ta\n2\tb\n"
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn row_count_excludes_the_header() {
        let dir = test_dir("count");
        let tsv = dir.join("notes.tsv");
        fs::write(&tsv, "noteId\tsummary\n1\ta\n2\tb\n3\tc\n").unwrap();

        assert_eq!(count_tsv_rows(&tsv).unwrap(), 3);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn row_count_of_empty_file_is_zero() {
        let dir = test_dir("count_empty");
        let tsv = dir.join("notes.tsv");
        fs::write(&tsv, "").unwrap();

        assert_eq!(count_tsv_rows(&tsv).unwrap(), 0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn cleanup_removes_only_other_dates() {
        let dir = test_dir("cleanup");
        fs::write(dir.join("2024-01-10-notes-00000.zip"), b"keep").unwrap();
        fs::write(dir.join("2024-01-10-notes-00000.tsv"), b"keep").unwrap();
        fs::write(dir.join("2024-01-09-notes-00000.zip"), b"old").unwrap();
        fs::write(dir.join("2024-01-03-notes-00001.tsv"), b"old").unwrap();

        cleanup_old_files(&dir, "2024-01-10");

        let mut remaining: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec![
                "2024-01-10-notes-00000.tsv".to_string(),
                "2024-01-10-notes-00000.zip".to_string(),
            ]
        );

        let _ = fs::remove_dir_all(&dir);
    }
}
