//! Throttled download progress accumulation.
//!
//! A [`ProgressTracker`] sits between the byte stream and the job row:
//! the fetcher feeds it every received chunk, and it decides when an
//! observation is worth persisting. Emission is throttled to bound write
//! amplification against the database — at most one write per percentage
//! step of 5 or per second, whichever fires first.

use std::time::Instant;

/// Minimum percentage advance between emissions.
const PCT_STEP: i32 = 5;

/// Maximum quiet time between emissions.
const EMIT_INTERVAL_SECS: f64 = 1.0;

/// One throttled progress observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Percentage of the declared total transferred, 0-100.
    pub percentage: i32,
    /// Smoothed transfer speed, formatted, e.g. `(3.2 MB/s)`.
    pub speed: String,
    /// Cumulative bytes received.
    pub bytes_read: u64,
    /// Declared total size of the transfer.
    pub total_bytes: u64,
}

/// Accumulates received chunk sizes and emits throttled observations.
///
/// When the transfer declares no total length (chunked encoding without
/// `Content-Length`), percentage is undefined and the tracker emits
/// nothing — it never divides by zero.
pub struct ProgressTracker {
    total_bytes: Option<u64>,
    bytes_read: u64,
    last_pct: i32,
    started: Instant,
    last_emit: Instant,
}

impl ProgressTracker {
    /// Creates a tracker for a transfer of `total_bytes`, if declared.
    #[must_use]
    pub fn new(total_bytes: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            total_bytes,
            bytes_read: 0,
            last_pct: 0,
            started: now,
            last_emit: now,
        }
    }

    /// Records a received chunk; returns an observation when one is due.
    pub fn record(&mut self, chunk_len: usize) -> Option<ProgressUpdate> {
        self.record_at(chunk_len, Instant::now())
    }

    fn record_at(&mut self, chunk_len: usize, now: Instant) -> Option<ProgressUpdate> {
        self.bytes_read += chunk_len as u64;

        let total = self.total_bytes.filter(|t| *t > 0)?;

        #[allow(clippy::cast_possible_truncation)]
        let pct = ((self.bytes_read * 100) / total) as i32;

        let elapsed_since_emit = now.duration_since(self.last_emit).as_secs_f64();
        if pct < self.last_pct + PCT_STEP && elapsed_since_emit < EMIT_INTERVAL_SECS {
            return None;
        }

        self.last_pct = pct;
        self.last_emit = now;

        // Speed is smoothed over the whole transfer, not an instantaneous
        // window, so a stalled stream decays visibly instead of freezing
        // at its last burst rate.
        let elapsed = now.duration_since(self.started).as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let bytes_per_sec = if elapsed > 0.0 {
            self.bytes_read as f64 / elapsed
        } else {
            0.0
        };

        Some(ProgressUpdate {
            percentage: pct,
            speed: format_speed(bytes_per_sec),
            bytes_read: self.bytes_read,
            total_bytes: total,
        })
    }
}

/// Formats a transfer speed the way the job history stores it.
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= 1024.0 * 1024.0 {
        format!("({:.1} MB/s)", bytes_per_sec / (1024.0 * 1024.0))
    } else if bytes_per_sec >= 1024.0 {
        format!("({:.1} KB/s)", bytes_per_sec / 1024.0)
    } else {
        format!("({bytes_per_sec:.0} B/s)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn emits_on_five_percent_steps() {
        let mut tracker = ProgressTracker::new(Some(1000));
        let start = tracker.started;

        // 4% — below the step threshold, same instant.
        assert!(tracker.record_at(40, start).is_none());

        // 6% cumulative — crosses the 5-point step.
        let update = tracker.record_at(20, start).unwrap();
        assert_eq!(update.percentage, 6);
        assert_eq!(update.bytes_read, 60);

        // 8% — only 2 points past the last emission.
        assert!(tracker.record_at(20, start).is_none());
    }

    #[test]
    fn emits_after_a_second_even_without_percent_advance() {
        let mut tracker = ProgressTracker::new(Some(1_000_000));
        let start = tracker.started;

        assert!(tracker.record_at(10, start).is_none());

        let later = start + Duration::from_millis(1100);
        let update = tracker.record_at(10, later).unwrap();
        assert_eq!(update.percentage, 0);
        assert_eq!(update.bytes_read, 20);
    }

    #[test]
    fn unknown_total_never_emits() {
        let mut tracker = ProgressTracker::new(None);
        let start = tracker.started;

        assert!(tracker.record_at(5000, start).is_none());
        let later = start + Duration::from_secs(10);
        assert!(tracker.record_at(5000, later).is_none());
    }

    #[test]
    fn zero_total_never_divides() {
        let mut tracker = ProgressTracker::new(Some(0));
        assert!(tracker.record(100).is_none());
    }

    #[test]
    fn percentage_is_monotonic_across_emissions() {
        let mut tracker = ProgressTracker::new(Some(100));
        let start = tracker.started;

        let mut last = -1;
        for _ in 0..20 {
            if let Some(update) = tracker.record_at(5, start) {
                assert!(update.percentage >= last);
                last = update.percentage;
            }
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn speed_is_smoothed_from_stream_open() {
        let mut tracker = ProgressTracker::new(Some(2048));
        let start = tracker.started;

        let later = start + Duration::from_secs(2);
        let update = tracker.record_at(2048, later).unwrap();
        // 2048 bytes over 2 seconds — 1 KB/s smoothed.
        assert_eq!(update.speed, "(1.0 KB/s)");
    }

    #[test]
    fn speed_formatting_picks_the_right_unit() {
        assert_eq!(format_speed(512.0), "(512 B/s)");
        assert_eq!(format_speed(2048.0), "(2.0 KB/s)");
        assert_eq!(format_speed(3.5 * 1024.0 * 1024.0), "(3.5 MB/s)");
    }
}
