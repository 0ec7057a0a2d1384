//! Retry policy for chunk transfers.
//!
//! Classifies transfer errors into kinds and decides whether a failed
//! attempt is retried. Network and protocol failures are transient on
//! long-lived circuits (a circuit rebuild mid-transfer looks like a reset
//! connection); on-disk state and I/O failures are not.

use std::time::Duration;

use crate::transfer::TransferError;

/// High-level classification of a transfer error for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation timed out (connect or stalled transfer).
    Timeout,
    /// Network-level failure (connection reset, DNS, proxy, ...).
    Connection,
    /// Server misbehaved: refused the range, replayed a full body, sent
    /// too many or too few bytes.
    Protocol,
    /// On-disk chunk state is inconsistent (part larger than its range).
    State,
    /// Filesystem failure.
    Io,
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry this error.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Fixed-delay retry policy: up to `max_attempts` per chunk with
/// `retry_delay` between attempts. A retry resumes from whatever the
/// previous attempt persisted; the transfer's own resume logic handles it.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Sleep between attempts.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Decide what to do after a failed attempt. `attempt` is 1-based
    /// (1 = first attempt).
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::NoRetry;
        }
        match kind {
            ErrorKind::State | ErrorKind::Io => RetryDecision::NoRetry,
            ErrorKind::Timeout | ErrorKind::Connection | ErrorKind::Protocol => {
                RetryDecision::RetryAfter(self.retry_delay)
            }
        }
    }
}

/// Classify a curl error for retry decisions. Everything curl reports at
/// this layer is a network-side failure and worth another attempt through
/// the same circuit.
pub fn classify_curl_error(e: &curl::Error) -> ErrorKind {
    if e.is_operation_timedout() {
        return ErrorKind::Timeout;
    }
    ErrorKind::Connection
}

/// Classify a transfer error into an ErrorKind.
pub fn classify(e: &TransferError) -> ErrorKind {
    match e {
        TransferError::Curl(ce) => classify_curl_error(ce),
        TransferError::Http(_) => ErrorKind::Protocol,
        TransferError::Overrun { .. } => ErrorKind::Protocol,
        TransferError::Incomplete { .. } => ErrorKind::Protocol,
        TransferError::OversizedPart { .. } => ErrorKind::State,
        TransferError::Io(_) => ErrorKind::Io,
    }
}
