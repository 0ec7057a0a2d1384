//! Download orchestrator: wires circuits, probe, chunk state, workers,
//! progress sampling, and the final merge for a single URL.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

use crate::chunk::ChunkController;
use crate::circuit::Circuit;
use crate::client::HttpClient;
use crate::merge::merge_chunks;
use crate::probe::remote_file_size;
use crate::progress::{ProgressStats, SAMPLE_INTERVAL};
use crate::retry::RetryPolicy;
use crate::worker::Worker;

/// Tuning for one download.
#[derive(Debug, Clone, Copy)]
pub struct DownloadOptions {
    /// Explicit chunk size in bytes; ignored when `chunk_count` is set.
    pub chunk_size: u64,
    /// When positive, chunk size becomes ⌈file_size / chunk_count⌉.
    pub chunk_count: u32,
    /// Number of worker tasks (at least 1).
    pub max_parallel: usize,
    /// Number of circuits; 0 means direct connection.
    pub num_circuits: usize,
}

/// Work directory for a destination: `<destination>.ktor`.
pub fn work_dir_for(destination: &Path) -> PathBuf {
    let mut path = destination.as_os_str().to_owned();
    path.push(".ktor");
    PathBuf::from(path)
}

/// Download `remote_url` to `destination`, splitting it into chunks spread
/// over `num_circuits` circuits with `max_parallel` workers.
///
/// Interrupted runs are resumable: rerunning with the same arguments picks
/// up every chunk from the bytes already on disk. When `progress_tx` is
/// set, a `ProgressStats` snapshot is sent every 200 ms plus a final one
/// after the last worker finishes.
pub async fn download(
    remote_url: &str,
    destination: &Path,
    opts: DownloadOptions,
    progress_tx: Option<mpsc::Sender<ProgressStats>>,
) -> Result<()> {
    if opts.max_parallel == 0 {
        bail!("number of parallel downloads cannot be 0");
    }

    let circuits = if opts.num_circuits > 0 {
        tracing::info!(count = opts.num_circuits, "creating circuits");
        Circuit::create_many(opts.num_circuits)
            .await
            .context("cannot create circuits")?
    } else {
        Vec::new()
    };

    let result = run_download(remote_url, destination, opts, progress_tx, &circuits).await;

    for circuit in circuits {
        circuit.close().await;
    }
    result
}

async fn run_download(
    remote_url: &str,
    destination: &Path,
    opts: DownloadOptions,
    progress_tx: Option<mpsc::Sender<ProgressStats>>,
    circuits: &[Circuit],
) -> Result<()> {
    let main_client = circuits
        .first()
        .map(Circuit::http_client)
        .unwrap_or_else(HttpClient::direct);

    let file_size = {
        let client = main_client.clone();
        let url = remote_url.to_string();
        tokio::task::spawn_blocking(move || remote_file_size(&client, &url))
            .await
            .context("size probe task failed")?
            .context("cannot get remote file size")?
    };
    tracing::info!(file_size, "remote file size");

    let chunk_size = if opts.chunk_count > 0 {
        let count = opts.chunk_count as u64;
        (file_size + count - 1) / count
    } else {
        opts.chunk_size
    };
    if chunk_size == 0 {
        bail!("chunk size cannot be 0");
    }

    let work_dir = work_dir_for(destination);
    let controller = Arc::new(ChunkController::new(
        remote_url, &work_dir, file_size, chunk_size,
    )?);

    let started = Instant::now();
    let (sampler_stop, sampler) = match progress_tx {
        Some(tx) => {
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            let handle = tokio::spawn(sample_progress(Arc::clone(&controller), tx, started, stop_rx));
            (Some(stop_tx), Some(handle))
        }
        None => (None, None),
    };

    let result = drive_workers(destination, opts, circuits, &controller).await;

    // Stop the sampler on every path so the progress channel closes; its
    // final snapshot reflects the terminal state.
    if let Some(stop) = sampler_stop {
        let _ = stop.send(());
    }
    if let Some(handle) = sampler {
        let _ = handle.await;
    }
    result
}

async fn drive_workers(
    destination: &Path,
    opts: DownloadOptions,
    circuits: &[Circuit],
    controller: &Arc<ChunkController>,
) -> Result<()> {
    let worker_count = opts.max_parallel;
    tracing::debug!(workers = worker_count, "starting download workers");
    let mut chunk_txs = Vec::with_capacity(worker_count);
    let mut worker_handles = Vec::with_capacity(worker_count);
    for index in 0..worker_count {
        let client = if circuits.is_empty() {
            HttpClient::direct()
        } else {
            circuits[index % circuits.len()].http_client()
        };
        let (tx, rx) = mpsc::channel(1);
        let worker = Worker::new(index, client, rx);
        worker_handles.push(tokio::spawn(worker.run(
            Arc::clone(controller),
            RetryPolicy::default(),
        )));
        chunk_txs.push(tx);
    }

    // Hand out chunks in index order, round-robin over the workers.
    let mut handed_out = 0usize;
    while let Some(chunk) = controller.next_not_started() {
        let target = handed_out % worker_count;
        chunk_txs[target]
            .send(chunk)
            .await
            .map_err(|_| anyhow::anyhow!("worker {} stopped accepting chunks", target))?;
        handed_out += 1;
    }
    drop(chunk_txs);

    for handle in worker_handles {
        handle.await.context("worker task failed")?;
    }

    let incomplete = controller.incomplete_indices();
    if !incomplete.is_empty() {
        for index in &incomplete {
            tracing::error!(chunk = *index, "chunk was not downloaded");
        }
        bail!(
            "{} of {} chunk(s) were not downloaded",
            incomplete.len(),
            controller.chunk_count()
        );
    }

    tracing::info!("merging chunks");
    let dest = destination.to_path_buf();
    let merge_controller = Arc::clone(controller);
    tokio::task::spawn_blocking(move || merge_chunks(&merge_controller, &dest))
        .await
        .context("merge task failed")?
        .context("cannot merge chunks")?;

    Ok(())
}

/// Poll the controller every 200 ms and forward snapshots; one final
/// snapshot goes out when the orchestrator signals completion.
async fn sample_progress(
    controller: Arc<ChunkController>,
    tx: mpsc::Sender<ProgressStats>,
    started: Instant,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => {
                let _ = tx.send(snapshot(&controller, started)).await;
                return;
            }
            _ = tokio::time::sleep(SAMPLE_INTERVAL) => {
                if tx.send(snapshot(&controller, started)).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn snapshot(controller: &ChunkController, started: Instant) -> ProgressStats {
    ProgressStats {
        bytes_done: controller.downloaded_bytes(),
        total_bytes: controller.file_size(),
        elapsed_secs: started.elapsed().as_secs_f64(),
        chunks_done: controller.completed_count(),
        chunk_count: controller.chunk_count(),
    }
}
