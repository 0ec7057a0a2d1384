//! Durable download identity: the `metadata.ktor` file.
//!
//! Three LF-separated lines inside the work directory (remote URL, file
//! size, chunk size, all decimal), written on first run and compared
//! strictly on every later run. A mismatch means the work directory belongs to a
//! different download and must not be silently reused.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

/// File name of the metadata record inside the work directory.
pub const METADATA_FILE: &str = "metadata.ktor";

/// Creates the work directory and metadata record on first run, or
/// validates the existing record against the requested download.
///
/// Comparison is strict string equality per field; sizes are written in
/// canonical decimal. Any differing field fails with an error naming it.
pub fn load_or_create(
    work_dir: &Path,
    remote_url: &str,
    file_size: u64,
    chunk_size: u64,
) -> Result<()> {
    let path = work_dir.join(METADATA_FILE);
    if !path.exists() {
        fs::create_dir_all(work_dir)
            .with_context(|| format!("cannot create work directory {}", work_dir.display()))?;
        let record = format!("{}\n{}\n{}", remote_url, file_size, chunk_size);
        fs::write(&path, record)
            .with_context(|| format!("cannot write {}", path.display()))?;
        return Ok(());
    }

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let mut lines = raw.lines();
    let (url_line, size_line, chunk_line) = match (lines.next(), lines.next(), lines.next()) {
        (Some(u), Some(s), Some(c)) => (u, s, c),
        _ => bail!("metadata file {} is malformed", path.display()),
    };

    if url_line != remote_url {
        bail!(
            "metadata mismatch: remote URL differs (recorded {}, requested {})",
            url_line,
            remote_url
        );
    }
    if size_line != file_size.to_string() {
        bail!(
            "metadata mismatch: file size differs (recorded {}, requested {})",
            size_line,
            file_size
        );
    }
    if chunk_line != chunk_size.to_string() {
        bail!(
            "metadata mismatch: chunk size differs (recorded {}, requested {})",
            chunk_line,
            chunk_size
        );
    }
    Ok(())
}
