//! Single-chunk HTTP Range transfer with append-resume.
//!
//! After a successful transfer the part file contains exactly the chunk's
//! bytes. Re-entry is idempotent: a part file already at full length is
//! accepted without a request, a strict prefix is extended with
//! `Range: bytes=(start+existing)-end`, and a part larger than the chunk is
//! an inconsistent-state failure (never truncated here).

use curl::easy::Easy;
use std::cell::Cell;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::client::HttpClient;

/// Receive buffer size requested from libcurl, so the body arrives in
/// ~32 KiB blocks.
const TRANSFER_BLOCK_SIZE: usize = 32 * 1024;

/// Abort a transfer that drops below 1 KiB/s for this long. Generous, to
/// tolerate slow circuit rebuilds mid-transfer.
const LOW_SPEED_WINDOW: std::time::Duration = std::time::Duration::from_secs(120);
const LOW_SPEED_FLOOR: u32 = 1024;

/// Error from a single chunk transfer. Carries enough structure for the
/// retry policy to classify: network and protocol failures retry, on-disk
/// state and I/O failures do not.
#[derive(Debug)]
pub enum TransferError {
    /// curl reported an error (timeout, connection, proxy, TLS, ...).
    Curl(curl::Error),
    /// Response status was not 206 Partial Content.
    Http(u32),
    /// Server sent more bytes than the requested range; the excess was
    /// discarded and the transfer failed.
    Overrun { expected: u64, received: u64 },
    /// Body ended before the range was satisfied.
    Incomplete { expected: u64, received: u64 },
    /// Part file on disk is larger than the chunk it backs.
    OversizedPart { actual: u64, expected: u64 },
    /// Filesystem failure (stat, open, write).
    Io(io::Error),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Curl(e) => write!(f, "{}", e),
            TransferError::Http(code) => {
                write!(f, "server did not honor range request (HTTP {})", code)
            }
            TransferError::Overrun { expected, received } => {
                write!(f, "server sent more than asked: {} of {} bytes", received, expected)
            }
            TransferError::Incomplete { expected, received } => {
                write!(f, "incomplete chunk download: {}/{}", received, expected)
            }
            TransferError::OversizedPart { actual, expected } => {
                write!(f, "existing chunk is larger than expected: {} > {}", actual, expected)
            }
            TransferError::Io(e) => write!(f, "chunk file: {}", e),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::Curl(e) => Some(e),
            TransferError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Stream the byte range `[start, end]` of `url` into `path`, resuming from
/// whatever the file already holds. `progress` is updated with the total
/// bytes persisted as blocks arrive; the sampler reads it concurrently.
///
/// Blocking; run under `spawn_blocking` from async code.
pub fn transfer_chunk(
    client: &HttpClient,
    url: &str,
    path: &Path,
    start: u64,
    end: u64,
    progress: &AtomicU64,
) -> Result<(), TransferError> {
    let expected = end - start + 1;

    let existing = existing_part_size(path)?;
    if existing > expected {
        return Err(TransferError::OversizedPart {
            actual: existing,
            expected,
        });
    }
    if existing == expected {
        progress.store(expected, Ordering::Relaxed);
        return Ok(());
    }

    let mut file = open_part_file(path, existing)?;
    progress.store(existing, Ordering::Relaxed);

    let mut easy = Easy::new();
    client.apply(&mut easy).map_err(TransferError::Curl)?;
    easy.url(url).map_err(TransferError::Curl)?;
    easy.range(&format!("{}-{}", start + existing, end))
        .map_err(TransferError::Curl)?;
    easy.buffer_size(TRANSFER_BLOCK_SIZE)
        .map_err(TransferError::Curl)?;
    easy.low_speed_limit(LOW_SPEED_FLOOR)
        .map_err(TransferError::Curl)?;
    easy.low_speed_time(LOW_SPEED_WINDOW)
        .map_err(TransferError::Curl)?;

    let status = Cell::new(0u32);
    let received = Cell::new(0u64);
    let overrun = Cell::new(false);
    let mut write_error: Option<io::Error> = None;
    let perform_result;
    {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                if let Some(code) = parse_status_line(data) {
                    status.set(code);
                }
                true
            })
            .map_err(TransferError::Curl)?;
        transfer
            .write_function(|data| {
                // Only a 206 body belongs in the part file; anything else
                // (200 full-body replay, error page) aborts the transfer.
                if status.get() != 206 {
                    return Ok(0);
                }
                let remaining = expected - existing - received.get();
                if remaining == 0 {
                    overrun.set(true);
                    return Ok(0);
                }
                let take = (data.len() as u64).min(remaining) as usize;
                if let Err(e) = file.write_all(&data[..take]) {
                    write_error = Some(e);
                    return Ok(0);
                }
                received.set(received.get() + take as u64);
                progress.store(existing + received.get(), Ordering::Relaxed);
                if take < data.len() {
                    overrun.set(true);
                    return Ok(take);
                }
                Ok(data.len())
            })
            .map_err(TransferError::Curl)?;
        perform_result = transfer.perform();
    }

    if let Some(e) = write_error {
        return Err(TransferError::Io(e));
    }
    let code = status.get();
    if code != 0 && code != 206 {
        return Err(TransferError::Http(code));
    }
    let downloaded = existing + received.get();
    if overrun.get() {
        return Err(TransferError::Overrun {
            expected,
            received: downloaded,
        });
    }
    if let Err(e) = perform_result {
        return Err(TransferError::Curl(e));
    }
    if downloaded != expected {
        return Err(TransferError::Incomplete {
            expected,
            received: downloaded,
        });
    }

    progress.store(expected, Ordering::Relaxed);
    Ok(())
}

/// Size of the existing part file, 0 when absent.
fn existing_part_size(path: &Path) -> Result<u64, TransferError> {
    match std::fs::metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(TransferError::Io(e)),
        Ok(meta) if meta.is_dir() => Err(TransferError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("chunk path {} is a directory", path.display()),
        ))),
        Ok(meta) => Ok(meta.len()),
    }
}

/// Append to a non-empty prefix, create+truncate otherwise.
fn open_part_file(path: &Path, existing: u64) -> Result<File, TransferError> {
    let result = if existing > 0 {
        OpenOptions::new().append(true).open(path)
    } else {
        File::create(path)
    };
    result.map_err(TransferError::Io)
}

/// Extract the status code from an `HTTP/…` status line; other header
/// lines yield `None`. Redirect hops each emit their own status line, so
/// the last one seen wins.
fn parse_status_line(data: &[u8]) -> Option<u32> {
    let line = std::str::from_utf8(data).ok()?;
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}
