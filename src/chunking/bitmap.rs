// Bitmap for tracking chunks the server has accepted

use crate::common::types::ChunkIndex;

/// Fixed-size bitmap over the chunks of one upload (1 bit = 1 chunk).
/// The chunk count is known before the first request is sent.
#[derive(Clone, PartialEq, Eq)]
pub struct ChunkBitmap {
    bitmap: Vec<u8>,
    total_chunks: u32,
    accepted_count: u32,
}

impl ChunkBitmap {
    pub fn new(total_chunks: u32) -> Self {
        Self {
            bitmap: vec![0u8; Self::capacity_to_bytes(total_chunks)],
            total_chunks,
            accepted_count: 0,
        }
    }

    #[inline]
    fn capacity_to_bytes(capacity: u32) -> usize {
        ((capacity + 7) / 8) as usize
    }

    #[inline]
    pub fn is_accepted(&self, chunk: ChunkIndex) -> bool {
        if chunk >= self.total_chunks {
            return false;
        }
        let byte_idx = (chunk >> 3) as usize;
        let bit_idx = (chunk & 7) as u8;
        (self.bitmap[byte_idx] & (1 << bit_idx)) != 0
    }

    /// Mark a chunk accepted.
    ///
    /// Returns `false` for duplicates and out-of-range indices.
    pub fn mark_accepted(&mut self, chunk: ChunkIndex) -> bool {
        if chunk >= self.total_chunks || self.is_accepted(chunk) {
            return false;
        }
        let byte_idx = (chunk >> 3) as usize;
        let bit_idx = (chunk & 7) as u8;
        self.bitmap[byte_idx] |= 1 << bit_idx;
        self.accepted_count += 1;
        true
    }

    pub fn is_complete(&self) -> bool {
        self.accepted_count == self.total_chunks
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn accepted_count(&self) -> u32 {
        self.accepted_count
    }

    /// Whole-number percentage, 100 for an empty upload.
    pub fn percent(&self) -> u8 {
        if self.total_chunks == 0 {
            return 100;
        }
        ((self.accepted_count as u64 * 100) / self.total_chunks as u64) as u8
    }

    /// Chunks not yet accepted, in index order
    pub fn find_missing(&self) -> Vec<ChunkIndex> {
        (0..self.total_chunks)
            .filter(|&chunk| !self.is_accepted(chunk))
            .collect()
    }
}

impl std::fmt::Debug for ChunkBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBitmap")
            .field("total_chunks", &self.total_chunks)
            .field("accepted_count", &self.accepted_count)
            .field("progress", &format!("{}%", self.percent()))
            .finish()
    }
}
