//! ChunkController: single source of truth for chunk state.
//!
//! Construction creates the work directory, validates (or writes) the
//! metadata record, plans the ranges, and classifies each on-disk part
//! file. Status transitions go through one short critical section; at most
//! one worker owns a chunk between the InProgress claim and its terminal
//! status.

use anyhow::{Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use super::{Chunk, ChunkStatus};
use crate::metadata;
use crate::planner::plan_ranges;

#[derive(Debug)]
pub struct ChunkController {
    work_dir: PathBuf,
    file_size: u64,
    chunk_size: u64,
    chunks: Vec<Arc<Chunk>>,
    statuses: Mutex<Vec<ChunkStatus>>,
}

impl ChunkController {
    /// Build the controller for one download: work directory, metadata
    /// check, range plan, and on-disk state scan.
    pub fn new(
        remote_url: &str,
        work_dir: &Path,
        file_size: u64,
        chunk_size: u64,
    ) -> Result<Self> {
        metadata::load_or_create(work_dir, remote_url, file_size, chunk_size)
            .with_context(|| format!("work directory {}", work_dir.display()))?;

        let ranges = plan_ranges(file_size, chunk_size);
        tracing::debug!(chunks = ranges.len(), chunk_size, "planned chunk ranges");

        let mut chunks = Vec::with_capacity(ranges.len());
        let mut statuses = Vec::with_capacity(ranges.len());
        for (index, range) in ranges.iter().enumerate() {
            let path = work_dir.join(format!("{}.part", index));
            let (status, bytes) = scan_part(&path, range.len())?;
            chunks.push(Arc::new(Chunk {
                index,
                remote_url: remote_url.to_string(),
                start: range.start,
                end: range.end,
                path,
                bytes_downloaded: AtomicU64::new(bytes),
            }));
            statuses.push(status);
        }

        Ok(Self {
            work_dir: work_dir.to_path_buf(),
            file_size,
            chunk_size,
            chunks,
            statuses: Mutex::new(statuses),
        })
    }

    /// Atomically claim the first NotStarted chunk, transitioning it to
    /// InProgress. Chunks are handed out in index order; returns `None`
    /// when nothing is left to start.
    pub fn next_not_started(&self) -> Option<Arc<Chunk>> {
        let mut statuses = self.statuses.lock().unwrap();
        for (index, status) in statuses.iter_mut().enumerate() {
            if *status == ChunkStatus::NotStarted {
                *status = ChunkStatus::InProgress;
                return Some(Arc::clone(&self.chunks[index]));
            }
        }
        None
    }

    /// Record a chunk's terminal status (worker-side transition).
    pub fn mark(&self, index: usize, status: ChunkStatus) {
        let mut statuses = self.statuses.lock().unwrap();
        statuses[index] = status;
    }

    /// Current status of one chunk.
    pub fn status(&self, index: usize) -> ChunkStatus {
        self.statuses.lock().unwrap()[index]
    }

    /// Total bytes persisted so far: full length for Completed chunks,
    /// the live counter for NotStarted/InProgress, nothing for Error.
    pub fn downloaded_bytes(&self) -> u64 {
        let statuses = self.statuses.lock().unwrap();
        self.chunks
            .iter()
            .zip(statuses.iter())
            .map(|(chunk, status)| match status {
                ChunkStatus::Completed => chunk.len(),
                ChunkStatus::NotStarted | ChunkStatus::InProgress => chunk.bytes_downloaded(),
                ChunkStatus::Error => 0,
            })
            .sum()
    }

    /// Indices of chunks not in Completed state.
    pub fn incomplete_indices(&self) -> Vec<usize> {
        let statuses = self.statuses.lock().unwrap();
        statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| **s != ChunkStatus::Completed)
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of Completed chunks.
    pub fn completed_count(&self) -> usize {
        let statuses = self.statuses.lock().unwrap();
        statuses
            .iter()
            .filter(|s| **s == ChunkStatus::Completed)
            .count()
    }

    pub fn chunks(&self) -> &[Arc<Chunk>] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

/// Classify one part file for resume:
/// missing → NotStarted at 0; exact size → Completed; a strict prefix →
/// NotStarted carrying the on-disk size (append-resume); larger than
/// expected → NotStarted at 0 (the transfer rejects it, nothing is
/// truncated here). Stat errors are fatal.
fn scan_part(path: &Path, expected: u64) -> Result<(ChunkStatus, u64)> {
    match std::fs::metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok((ChunkStatus::NotStarted, 0)),
        Err(e) => Err(e).with_context(|| format!("cannot stat {}", path.display())),
        Ok(meta) => {
            let size = meta.len();
            if size == expected {
                Ok((ChunkStatus::Completed, size))
            } else if size > 0 && size < expected {
                Ok((ChunkStatus::NotStarted, size))
            } else {
                Ok((ChunkStatus::NotStarted, 0))
            }
        }
    }
}
