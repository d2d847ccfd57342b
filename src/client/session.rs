// Upload session bookkeeping

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use ring::rand::SecureRandom;
use tokio_util::sync::CancellationToken;

use super::api::{ChunkUpload, InitUpload};
use crate::chunking::{ChunkBitmap, FileChunker};
use crate::common::error::{Error, Result};
use crate::common::types::*;

/// State of one chunked upload attempt. Lives from `init` until a terminal state.
#[derive(Debug)]
pub struct UploadSession {
    pub upload_id: UploadId,
    chunker: FileChunker,
    accepted: ChunkBitmap,
    failed: BTreeSet<ChunkIndex>,
    cancel: CancellationToken,
    state: UploadState,
}

impl UploadSession {
    pub fn new(chunker: FileChunker, cancel: CancellationToken) -> Result<Self> {
        let accepted = ChunkBitmap::new(chunker.total_chunks());
        Ok(Self {
            upload_id: Self::generate_upload_id()?,
            chunker,
            accepted,
            failed: BTreeSet::new(),
            cancel,
            state: UploadState::Initializing,
        })
    }

    /// `upload_<unix millis>_<10 hex chars>`, unique per attempt.
    pub fn generate_upload_id() -> Result<UploadId> {
        let mut random_bytes = [0u8; 5];
        ring::rand::SystemRandom::new()
            .fill(&mut random_bytes)
            .map_err(|_| Error::Io(std::io::Error::other("system random source unavailable")))?;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Ok(format!("upload_{}_{}", millis, hex::encode(random_bytes)))
    }

    pub fn file_name(&self) -> &str {
        self.chunker.file_name()
    }

    pub fn file_size(&self) -> u64 {
        self.chunker.file_size()
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunker.total_chunks()
    }

    pub fn init_request(&self, restart_project: bool) -> InitUpload {
        InitUpload {
            upload_id: self.upload_id.clone(),
            file_name: self.file_name().to_string(),
            file_size: self.file_size(),
            chunk_size: self.chunker.plan().chunk_size() as u64,
            total_chunks: self.total_chunks(),
            restart_project,
        }
    }

    /// Read a chunk and wrap it as a request.
    pub async fn chunk_request(&self, index: ChunkIndex) -> Result<ChunkUpload> {
        Ok(ChunkUpload {
            upload_id: self.upload_id.clone(),
            chunk_index: index,
            total_chunks: self.total_chunks(),
            data: self.chunker.read_chunk(index).await?,
        })
    }

    pub fn batches(&self, batch_size: usize) -> Vec<Vec<ChunkIndex>> {
        self.chunker.plan().batches(batch_size)
    }

    pub fn record_success(&mut self, index: ChunkIndex) {
        self.failed.remove(&index);
        self.accepted.mark_accepted(index);
    }

    pub fn record_failure(&mut self, index: ChunkIndex) {
        if !self.accepted.is_accepted(index) {
            self.failed.insert(index);
        }
    }

    pub fn failed_chunks(&self) -> Vec<ChunkIndex> {
        self.failed.iter().copied().collect()
    }

    /// Chunks the server has not accepted, failed or never sent.
    pub fn missing_chunks(&self) -> Vec<ChunkIndex> {
        self.accepted.find_missing()
    }

    pub fn accepted_count(&self) -> u32 {
        self.accepted.accepted_count()
    }

    pub fn percent(&self) -> u8 {
        self.accepted.percent()
    }

    pub fn is_complete(&self) -> bool {
        self.accepted.is_complete()
    }

    pub fn update_state(&mut self, state: UploadState) {
        if self.state != state {
            debug!("Upload: {} {:?} -> {:?}", self.upload_id, self.state, state);
            self.state = state;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
