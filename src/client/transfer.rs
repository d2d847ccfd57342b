// Client-side upload pipeline

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use super::api::{ByteProgress, ConsoleApi};
use super::session::UploadSession;
use super::sink::{ConsoleSink, Notice, UploadProgress};
use super::token::TokenManager;
use crate::chunking::FileChunker;
use crate::common::config::ClientConfig;
use crate::common::error::{Error, Result};
use crate::common::types::*;
use crate::retransmission::{RetryPolicy, RetryQueue};

/// Terminal result of one upload call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed,
    Failed(String),
    Cancelled,
    /// Another upload was running; nothing was sent.
    Busy,
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Completed)
    }
}

/// Latest progress, shared with byte-level callbacks.
#[derive(Clone)]
struct ProgressReporter {
    sink: Arc<dyn ConsoleSink>,
    latest: Arc<Mutex<Option<UploadProgress>>>,
}

impl ProgressReporter {
    fn report(&self, state: UploadState, percent: u8, message: impl Into<String>) {
        let progress = UploadProgress::new(state, percent, message);
        self.sink.upload_progress(&progress);
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(progress);
    }

    fn latest(&self) -> Option<UploadProgress> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Clears the single upload slot when the upload ends, however it ends.
struct ActiveUpload<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
}

impl Drop for ActiveUpload<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

pub struct UploadPipeline {
    api: Arc<dyn ConsoleApi>,
    tokens: Arc<TokenManager>,
    progress: ProgressReporter,
    chunk_size: usize,
    batch_size: usize,
    retry: RetryPolicy,
    active: Mutex<Option<CancellationToken>>,
}

impl UploadPipeline {
    pub fn new(
        config: &ClientConfig,
        api: Arc<dyn ConsoleApi>,
        tokens: Arc<TokenManager>,
        sink: Arc<dyn ConsoleSink>,
    ) -> Self {
        Self {
            api,
            tokens,
            progress: ProgressReporter {
                sink,
                latest: Arc::new(Mutex::new(None)),
            },
            chunk_size: config.chunk_size,
            batch_size: config.max_concurrent_chunks.max(1),
            retry: RetryPolicy::new(config.chunk_retry_attempts, config.retry_backoff_step),
            active: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_busy(&self) -> bool {
        self.slot().is_some()
    }

    pub fn latest_progress(&self) -> Option<UploadProgress> {
        self.progress.latest()
    }

    /// Raise the cancellation signal of the running upload, if any.
    pub fn cancel(&self) -> bool {
        match self.slot().as_ref() {
            Some(token) => {
                token.cancel();
                self.progress
                    .sink
                    .notify(&Notice::info("Cancelling", "Upload is being cancelled..."));
                true
            }
            None => false,
        }
    }

    /// Claim the slot, or `None` when an upload is already running.
    fn begin(&self) -> Option<(CancellationToken, ActiveUpload<'_>)> {
        let mut slot = self.slot();
        if slot.is_some() {
            return None;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        Some((token, ActiveUpload { slot: &self.active }))
    }

    fn reject_busy(&self) -> UploadOutcome {
        warn!("Upload: rejected, another upload is in progress");
        self.progress.sink.notify(&Notice::warning(
            "Upload in Progress",
            "Please wait for current upload to complete",
        ));
        UploadOutcome::Busy
    }

    /// Chunked upload: init, batched chunks, sequential retries, finalize.
    pub async fn upload_chunked(&self, path: &Path, restart: bool) -> UploadOutcome {
        let Some((cancel, _active)) = self.begin() else {
            return self.reject_busy();
        };
        let result = self.run_chunked(path, restart, &cancel).await;
        self.finish(path, result).await
    }

    /// Whole file in one request, same progress and outcome contract.
    pub async fn upload_whole(&self, path: &Path, restart: bool) -> UploadOutcome {
        let Some((cancel, _active)) = self.begin() else {
            return self.reject_busy();
        };
        let result = self.run_whole(path, restart, &cancel).await;
        self.finish(path, result).await
    }

    async fn run_chunked(&self, path: &Path, restart: bool, cancel: &CancellationToken) -> Result<()> {
        let chunker = FileChunker::new(path, self.chunk_size).await?;
        let mut session = UploadSession::new(chunker, cancel.clone())?;
        let total = session.total_chunks();
        info!(
            "Upload: starting {} ({} bytes, {} chunks) as {}",
            session.file_name(),
            session.file_size(),
            total,
            session.upload_id
        );
        self.progress.report(
            UploadState::Initializing,
            0,
            format!("Preparing {}...", session.file_name()),
        );

        let token = guarded(cancel, self.tokens.acquire()).await?;
        guarded(cancel, self.api.init_upload(&session.init_request(restart), &token)).await?;

        session.update_state(UploadState::Transferring);
        for batch in session.batches(self.batch_size) {
            // strictly one batch at a time, at most `batch_size` requests in flight
            if session.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let results = join_all(
                batch
                    .iter()
                    .map(|&index| self.send_chunk(&session, index, &token, cancel)),
            )
            .await;

            let mut rejected = false;
            for (index, result) in batch.into_iter().zip(results) {
                match result {
                    Ok(()) => {
                        session.record_success(index);
                        self.progress.report(
                            UploadState::Transferring,
                            session.percent(),
                            format!("Uploading... {}/{} chunks", session.accepted_count(), total),
                        );
                    }
                    Err(Error::Cancelled) => {}
                    Err(Error::Forbidden) => {
                        warn!("Upload: chunk {} rejected, token invalid", index);
                        rejected = true;
                    }
                    Err(e) => {
                        warn!("Upload: chunk {} failed: {}", index, e);
                        session.record_failure(index);
                    }
                }
            }
            if rejected {
                return Err(Error::Forbidden);
            }
        }
        if session.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut queue = RetryQueue::new();
        queue.enqueue_batch(session.failed_chunks());
        if !queue.is_empty() {
            info!("Upload: retrying {} failed chunks", queue.pending_count());
            session.update_state(UploadState::Retrying);
        }
        while let Some(index) = queue.next() {
            let result = self
                .retry
                .run(cancel, |attempt| {
                    debug!("Upload: chunk {} retry attempt {}", index, attempt + 1);
                    self.send_chunk(&session, index, &token, cancel)
                })
                .await;
            match result {
                Ok(()) => {
                    session.record_success(index);
                    self.progress.report(
                        UploadState::Retrying,
                        session.percent(),
                        format!("Retrying... {}/{} chunks", session.accepted_count(), total),
                    );
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(Error::Forbidden) => return Err(Error::Forbidden),
                Err(e) => {
                    error!("Upload: chunk {} failed after retries: {}", index, e);
                    return Err(Error::ChunkFailed {
                        index,
                        attempts: self.retry.max_attempts,
                    });
                }
            }
        }

        if !session.is_complete() {
            let missing = session.missing_chunks();
            return Err(Error::ChunkFailed {
                index: missing.first().copied().unwrap_or_default(),
                attempts: self.retry.max_attempts,
            });
        }
        if session.is_cancelled() {
            return Err(Error::Cancelled);
        }

        session.update_state(UploadState::Finalizing);
        self.progress.report(UploadState::Finalizing, 100, "Finalizing...");
        guarded(cancel, self.api.finalize_upload(&session.upload_id, &token)).await?;
        session.update_state(UploadState::Completed);
        info!("Upload: {} finalized", session.upload_id);
        Ok(())
    }

    async fn send_chunk(
        &self,
        session: &UploadSession,
        index: ChunkIndex,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = session.chunk_request(index).await?;
        guarded(cancel, self.api.upload_chunk(request, token)).await
    }

    async fn run_whole(&self, path: &Path, restart: bool, cancel: &CancellationToken) -> Result<()> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
        info!("Upload: sending {} as a single request ({} bytes)", path.display(), metadata.len());
        self.progress.report(UploadState::Transferring, 0, "Uploading...");

        let token = guarded(cancel, self.tokens.acquire()).await?;
        let reporter = self.progress.clone();
        let on_bytes: ByteProgress = Arc::new(move |sent, total| {
            let percent = if total == 0 { 100 } else { (sent * 100 / total) as u8 };
            reporter.report(
                UploadState::Transferring,
                percent,
                format!("Uploading... {} / {}", format_size(sent), format_size(total)),
            );
        });
        guarded(cancel, self.api.upload_whole(path, restart, &token, on_bytes)).await
    }

    async fn finish(&self, path: &Path, result: Result<()>) -> UploadOutcome {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let sink = &self.progress.sink;

        match result {
            Ok(()) => {
                self.progress.report(UploadState::Completed, 100, "Complete!");
                sink.notify(&Notice::success(
                    "Upload Complete",
                    format!("{} uploaded successfully", name),
                ));
                self.tokens.rotate_quietly().await;
                sink.history_changed();
                UploadOutcome::Completed
            }
            Err(Error::Cancelled) => {
                info!("Upload: {} cancelled", name);
                self.tokens.consume();
                self.progress.report(UploadState::Cancelled, 0, "Cancelled");
                sink.notify(&Notice::warning("Upload Cancelled", "File upload was cancelled"));
                UploadOutcome::Cancelled
            }
            Err(Error::Forbidden) => {
                error!("Upload: {} rejected, token invalid or expired", name);
                self.tokens.rotate_quietly().await;
                self.progress.report(UploadState::Failed, 0, "Failed");
                sink.notify(&Notice::error("Security Error", "Invalid or expired token"));
                UploadOutcome::Failed(Error::Forbidden.to_string())
            }
            Err(e) => {
                error!("Upload: {} failed: {}", name, e);
                self.tokens.consume();
                self.progress.report(UploadState::Failed, 0, "Failed");
                sink.notify(&Notice::error("Upload Failed", e.to_string()));
                UploadOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Race `fut` against the cancellation signal.
async fn guarded<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
