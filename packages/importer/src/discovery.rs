//! Discovery of the newest published dataset date and its file count.
//!
//! The publisher uploads archives under
//! `<base>/<YYYY/MM/DD>/notes/notes-NNNNN.zip`. Discovery probes with
//! HEAD requests only — no body transfer — and is entirely read-only, so
//! the scheduler and the `latest-available` endpoint reuse it freely
//! without starting a job.

use chrono::{Days, NaiveDate, Utc};

/// Hard cap on the sequential file probe, so a misbehaving endpoint that
/// answers 200 for everything cannot drive an unbounded scan.
pub const MAX_FILES_PER_DATE: usize = 100;

/// Errors from discovery probing.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The whole lookback window was probed without finding data.
    #[error("No data files found in the last {lookback_days} days")]
    NoDataFound {
        /// Size of the probed window in days.
        lookback_days: u32,
    },

    /// The date exists but file index 0 disappeared between probes.
    #[error("No files found for date {date}")]
    NoFilesForDate {
        /// The probed date.
        date: NaiveDate,
    },
}

/// Remote archive name for a file index, e.g. `notes-00003.zip`.
#[must_use]
pub fn archive_name(index: usize) -> String {
    format!("notes-{index:05}.zip")
}

/// Expected payload entry inside an archive, e.g. `notes-00003.tsv`.
#[must_use]
pub fn payload_name(index: usize) -> String {
    format!("notes-{index:05}.tsv")
}

/// Local cache file name, prefixed with the dataset date so stale dates
/// can be swept by prefix after a successful import.
#[must_use]
pub fn cache_file_name(date: NaiveDate, index: usize) -> String {
    format!("{date}-notes-{index:05}.zip")
}

/// Full URL of an archive for a date and file index.
#[must_use]
pub fn archive_url(base_url: &str, date: NaiveDate, index: usize) -> String {
    format!(
        "{}/{}/notes/{}",
        base_url.trim_end_matches('/'),
        date.format("%Y/%m/%d"),
        archive_name(index)
    )
}

/// HEAD-probes a URL for existence. Network errors count as absence —
/// the day-walk and the sequential scan both treat them as "not there".
async fn exists(client: &reqwest::Client, url: &str) -> bool {
    match client.head(url).send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            log::debug!("HEAD {url} failed: {e}");
            false
        }
    }
}

/// Finds the most recent date with published data.
///
/// Tries today first, then walks backward one day at a time, probing
/// file index 0 for each date.
///
/// # Errors
///
/// Returns [`DiscoveryError::NoDataFound`] if no date within the
/// lookback window has data.
pub async fn find_latest_date(
    client: &reqwest::Client,
    base_url: &str,
    lookback_days: u32,
) -> Result<NaiveDate, DiscoveryError> {
    let today = Utc::now().date_naive();

    for days_ago in 0..lookback_days {
        let date = today
            .checked_sub_days(Days::new(u64::from(days_ago)))
            .unwrap_or(today);

        if exists(client, &archive_url(base_url, date, 0)).await {
            log::info!("Latest available dataset date: {date}");
            return Ok(date);
        }
    }

    Err(DiscoveryError::NoDataFound { lookback_days })
}

/// Counts how many sequentially numbered files exist for a date.
///
/// Probes indices 0, 1, 2, … and stops at the first index that does not
/// exist — the indices are assumed contiguous from zero, so a gap means
/// the end of the sequence. If the publisher ever switched to a sparse
/// index set this would under-count; that assumption is deliberate.
///
/// # Errors
///
/// Returns [`DiscoveryError::NoFilesForDate`] if even index 0 is absent.
pub async fn count_files(
    client: &reqwest::Client,
    base_url: &str,
    date: NaiveDate,
) -> Result<usize, DiscoveryError> {
    for index in 0..MAX_FILES_PER_DATE {
        if !exists(client, &archive_url(base_url, date, index)).await {
            if index == 0 {
                return Err(DiscoveryError::NoFilesForDate { date });
            }
            return Ok(index);
        }
    }

    Ok(MAX_FILES_PER_DATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn archive_names_are_zero_padded_to_five() {
        assert_eq!(archive_name(0), "notes-00000.zip");
        assert_eq!(archive_name(42), "notes-00042.zip");
        assert_eq!(payload_name(7), "notes-00007.tsv");
    }

    #[test]
    fn cache_name_is_prefixed_with_the_dataset_date() {
        assert_eq!(
            cache_file_name(date("2024-01-10"), 3),
            "2024-01-10-notes-00003.zip"
        );
    }

    #[test]
    fn archive_url_uses_slash_separated_date() {
        assert_eq!(
            archive_url("https://example.com/data", date("2024-01-10"), 0),
            "https://example.com/data/2024/01/10/notes/notes-00000.zip"
        );
    }

    #[test]
    fn archive_url_tolerates_trailing_slash_in_base() {
        assert_eq!(
            archive_url("https://example.com/data/", date("2024-12-31"), 11),
            "https://example.com/data/2024/12/31/notes/notes-00011.zip"
        );
    }
}
