pub mod chunker;
pub mod bitmap;

pub use chunker::{ChunkPlan, FileChunker};
pub use bitmap::ChunkBitmap;
