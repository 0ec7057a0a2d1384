//! Download worker: one circuit-bound client, chunks processed serially.
//!
//! Each worker pulls chunks from its input channel and runs the blocking
//! transfer on the blocking pool. A failed attempt is retried per the
//! policy; a retry resumes from whatever the previous attempt persisted,
//! and the part file is never removed between attempts.

use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::chunk::{Chunk, ChunkController, ChunkStatus};
use crate::client::HttpClient;
use crate::retry::{classify, RetryDecision, RetryPolicy};
use crate::transfer::{transfer_chunk, TransferError};

pub(crate) struct Worker {
    index: usize,
    client: HttpClient,
    chunks_rx: mpsc::Receiver<Arc<Chunk>>,
}

impl Worker {
    pub(crate) fn new(index: usize, client: HttpClient, chunks_rx: mpsc::Receiver<Arc<Chunk>>) -> Self {
        Self {
            index,
            client,
            chunks_rx,
        }
    }

    /// Consume chunks until the input channel closes, moving each to a
    /// terminal status on the controller.
    pub(crate) async fn run(mut self, controller: Arc<ChunkController>, policy: RetryPolicy) {
        tracing::debug!(
            worker = self.index,
            proxied = self.client.is_proxied(),
            "worker started"
        );

        while let Some(chunk) = self.chunks_rx.recv().await {
            tracing::debug!(
                worker = self.index,
                chunk = chunk.index,
                start = chunk.start,
                end = chunk.end,
                "downloading chunk"
            );

            let mut attempt = 1u32;
            let outcome = loop {
                match self.transfer_once(&chunk).await {
                    Ok(()) => {
                        tracing::debug!(worker = self.index, chunk = chunk.index, "chunk completed");
                        break ChunkStatus::Completed;
                    }
                    Err(e) => match policy.decide(attempt, classify(&e)) {
                        RetryDecision::RetryAfter(delay) => {
                            tracing::warn!(
                                worker = self.index,
                                chunk = chunk.index,
                                attempt,
                                max_attempts = policy.max_attempts,
                                error = %e,
                                "chunk transfer failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        RetryDecision::NoRetry => {
                            tracing::error!(
                                worker = self.index,
                                chunk = chunk.index,
                                error = %e,
                                "cannot download chunk"
                            );
                            break ChunkStatus::Error;
                        }
                    },
                }
            };
            controller.mark(chunk.index, outcome);
        }

        tracing::debug!(worker = self.index, "worker finished");
    }

    async fn transfer_once(&self, chunk: &Arc<Chunk>) -> Result<(), TransferError> {
        let client = self.client.clone();
        let chunk = Arc::clone(chunk);
        tokio::task::spawn_blocking(move || {
            transfer_chunk(
                &client,
                &chunk.remote_url,
                &chunk.path,
                chunk.start,
                chunk.end,
                chunk.progress(),
            )
        })
        .await
        .map_err(|e| TransferError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?
    }
}
