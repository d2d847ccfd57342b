// Chunk planning and chunk reads over an upload file
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::common::error::{Error, Result};
use crate::common::types::ChunkIndex;

/// How a file of `file_size` bytes splits into fixed-size chunks.
/// Every chunk is `chunk_size` long except possibly the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
    total_chunks: u32,
}

impl ChunkPlan {
    pub fn new(file_size: u64, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::ConfigError("chunk size must be non-zero".to_string()));
        }
        let chunk_size = chunk_size as u64;
        let total = (file_size + chunk_size - 1) / chunk_size;
        let total_chunks = u32::try_from(total).map_err(|_| {
            Error::ConfigError(format!("{} bytes needs too many chunks of {}", file_size, chunk_size))
        })?;

        Ok(Self {
            file_size,
            chunk_size,
            total_chunks,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size as usize
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Byte offset and length of a chunk, `None` past the end.
    pub fn range(&self, index: ChunkIndex) -> Option<(u64, usize)> {
        if index >= self.total_chunks {
            return None;
        }
        let offset = index as u64 * self.chunk_size;
        let len = self.chunk_size.min(self.file_size - offset);
        Some((offset, len as usize))
    }

    /// Indices grouped into consecutive batches of at most `batch_size`.
    pub fn batches(&self, batch_size: usize) -> Vec<Vec<ChunkIndex>> {
        let indices: Vec<ChunkIndex> = (0..self.total_chunks).collect();
        indices
            .chunks(batch_size.max(1))
            .map(|batch| batch.to_vec())
            .collect()
    }
}

/// Reads individual chunks of a file on demand, so chunks in one batch can be
/// read independently of each other.
#[derive(Debug, Clone)]
pub struct FileChunker {
    path: PathBuf,
    file_name: String,
    plan: ChunkPlan,
}

impl FileChunker {
    /// Open `file_path` and plan its chunks.
    pub async fn new(file_path: &Path, chunk_size: usize) -> Result<Self> {
        let metadata = tokio::fs::metadata(file_path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound(file_path.display().to_string()),
            _ => Error::Io(e),
        })?;
        if !metadata.is_file() {
            return Err(Error::FileNotFound(file_path.display().to_string()));
        }

        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.display().to_string());

        Ok(Self {
            path: file_path.to_path_buf(),
            file_name,
            plan: ChunkPlan::new(metadata.len(), chunk_size)?,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    pub fn total_chunks(&self) -> u32 {
        self.plan.total_chunks()
    }

    pub fn file_size(&self) -> u64 {
        self.plan.file_size()
    }

    /// Read one chunk's bytes.
    pub async fn read_chunk(&self, index: ChunkIndex) -> Result<Bytes> {
        let (offset, len) = self.plan.range(index).ok_or_else(|| {
            Error::ConfigError(format!(
                "chunk {} beyond {} chunks",
                index,
                self.plan.total_chunks()
            ))
        })?;

        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }
}
