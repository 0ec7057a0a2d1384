//! Final merge: concatenate completed parts into the destination.
//!
//! The parts are streamed into a temp file inside the work directory and
//! renamed onto the destination, so a failed merge never leaves a
//! half-written destination and can simply be retried. The work directory
//! is removed only after the rename lands.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io;
use std::path::Path;

use crate::chunk::{ChunkController, ChunkStatus};

const MERGE_TEMP_NAME: &str = "merged.tmp";

/// Concatenate every chunk's part file in index order into `destination`
/// and remove the work directory. Every chunk must be Completed.
///
/// Blocking; run under `spawn_blocking` from async code.
pub fn merge_chunks(controller: &ChunkController, destination: &Path) -> Result<()> {
    for chunk in controller.chunks() {
        if controller.status(chunk.index) != ChunkStatus::Completed {
            bail!(
                "cannot merge chunks, chunk {} is not downloaded",
                chunk.path.display()
            );
        }
    }

    let temp_path = controller.work_dir().join(MERGE_TEMP_NAME);
    {
        let mut out = File::create(&temp_path)
            .with_context(|| format!("cannot create {}", temp_path.display()))?;
        for chunk in controller.chunks() {
            let mut part = File::open(&chunk.path)
                .with_context(|| format!("cannot open {}", chunk.path.display()))?;
            io::copy(&mut part, &mut out)
                .with_context(|| format!("cannot copy {}", chunk.path.display()))?;
        }
        out.sync_all()
            .with_context(|| format!("cannot sync {}", temp_path.display()))?;
    }

    fs::rename(&temp_path, destination).with_context(|| {
        format!(
            "cannot move merged file to {}",
            destination.display()
        )
    })?;
    fs::remove_dir_all(controller.work_dir()).with_context(|| {
        format!(
            "cannot remove work directory {}",
            controller.work_dir().display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const URL: &str = "http://example.com/file.bin";

    fn controller_with_parts(
        parts: &[&[u8]],
        file_size: u64,
        chunk_size: u64,
    ) -> (tempfile::TempDir, PathBuf, ChunkController) {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("file.bin");
        let work = dir.path().join("file.bin.ktor");
        fs::create_dir_all(&work).unwrap();
        for (i, part) in parts.iter().enumerate() {
            fs::write(work.join(format!("{}.part", i)), part).unwrap();
        }
        let controller = ChunkController::new(URL, &work, file_size, chunk_size).unwrap();
        (dir, dest, controller)
    }

    #[test]
    fn merge_concatenates_in_index_order_and_removes_work_dir() {
        let (_dir, dest, controller) =
            controller_with_parts(&[b"aaaa", b"bbbb", b"cc"], 10, 4);
        let work = controller.work_dir().to_path_buf();

        merge_chunks(&controller, &dest).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"aaaabbbbcc");
        assert!(!work.exists());
    }

    #[test]
    fn merge_refuses_incomplete_chunks_and_keeps_work_dir() {
        // 1.part holds 2 of 4 bytes: scanned as NotStarted.
        let (_dir, dest, controller) = controller_with_parts(&[b"aaaa", b"bb"], 8, 4);
        let err = merge_chunks(&controller, &dest).unwrap_err();
        assert!(err.to_string().contains("not downloaded"));
        assert!(controller.work_dir().exists());
        assert!(!dest.exists());
    }

    #[test]
    fn merge_overwrites_existing_destination() {
        let (_dir, dest, controller) = controller_with_parts(&[b"fresh"], 5, 5);
        fs::write(&dest, b"stale-and-longer").unwrap();

        merge_chunks(&controller, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"fresh");
    }
}
