//! Progress reporting for downloads (bytes done, ETA, rate).
//!
//! The orchestrator samples the chunk controller on a fixed tick and sends
//! snapshots to the consumer; rate and ETA are derived here.

use std::time::Duration;

/// How often the orchestrator samples total progress.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

/// Snapshot of one download's progress.
#[derive(Debug, Clone)]
pub struct ProgressStats {
    /// Bytes persisted so far across all chunks.
    pub bytes_done: u64,
    /// Total file size in bytes.
    pub total_bytes: u64,
    /// Elapsed time since download start (seconds).
    pub elapsed_secs: f64,
    /// Number of chunks completed.
    pub chunks_done: usize,
    /// Total number of chunks.
    pub chunk_count: usize,
}

impl ProgressStats {
    /// Total download rate in bytes per second (0 if elapsed is 0).
    pub fn bytes_per_sec(&self) -> f64 {
        if self.elapsed_secs <= 0.0 {
            return 0.0;
        }
        self.bytes_done as f64 / self.elapsed_secs
    }

    /// Estimated seconds remaining (None if rate is 0 and bytes remain).
    pub fn eta_secs(&self) -> Option<f64> {
        let remaining = self.total_bytes.saturating_sub(self.bytes_done);
        if remaining == 0 {
            return Some(0.0);
        }
        let rate = self.bytes_per_sec();
        if rate <= 0.0 {
            return None;
        }
        Some(remaining as f64 / rate)
    }

    /// Fraction complete in [0.0, 1.0].
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.bytes_done as f64 / self.total_bytes as f64).min(1.0)
    }
}
