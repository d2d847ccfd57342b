// Payload decompression: gzip, zlib-wrapped deflate and raw deflate
use std::fmt;
use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

/// Upper bound on a single decompressed payload.
pub const MAX_DECOMPRESSED_BYTES: u64 = 64 << 20;

/// Fixed fallback order once the sniffed format has been tried.
const FALLBACK_ORDER: [CompressionFormat; 3] = [
    CompressionFormat::Gzip,
    CompressionFormat::Zlib,
    CompressionFormat::RawDeflate,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    Gzip,
    Zlib,
    RawDeflate,
}

impl CompressionFormat {
    /// Sniffs the format from the leading bytes: `1F 8B` is gzip, a leading `78` is a
    /// zlib header, anything else is assumed to be raw deflate.
    pub fn detect(data: &[u8]) -> Self {
        match data {
            [0x1f, 0x8b, ..] => CompressionFormat::Gzip,
            [0x78, ..] => CompressionFormat::Zlib,
            _ => CompressionFormat::RawDeflate,
        }
    }

    /// Detected format first, then the remaining two in fixed order.
    pub fn cascade(data: &[u8]) -> Vec<CompressionFormat> {
        let detected = Self::detect(data);
        std::iter::once(detected)
            .chain(FALLBACK_ORDER.into_iter().filter(move |f| *f != detected))
            .collect()
    }

    pub fn name(&self) -> &'static str {
        match self {
            CompressionFormat::Gzip => "gzip",
            CompressionFormat::Zlib => "deflate",
            CompressionFormat::RawDeflate => "deflate-raw",
        }
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Trait for payload decompression
pub trait PayloadDecompressor: Send + Sync {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, String>;
    fn format(&self) -> CompressionFormat;
}

pub struct GzipDecompressor;

impl PayloadDecompressor for GzipDecompressor {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, String> {
        read_bounded(GzDecoder::new(data))
    }

    fn format(&self) -> CompressionFormat {
        CompressionFormat::Gzip
    }
}

pub struct ZlibDecompressor;

impl PayloadDecompressor for ZlibDecompressor {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, String> {
        read_bounded(ZlibDecoder::new(data))
    }

    fn format(&self) -> CompressionFormat {
        CompressionFormat::Zlib
    }
}

pub struct RawDeflateDecompressor;

impl PayloadDecompressor for RawDeflateDecompressor {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, String> {
        read_bounded(DeflateDecoder::new(data))
    }

    fn format(&self) -> CompressionFormat {
        CompressionFormat::RawDeflate
    }
}

fn read_bounded<R: Read>(reader: R) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    reader
        .take(MAX_DECOMPRESSED_BYTES + 1)
        .read_to_end(&mut out)
        .map_err(|e| e.to_string())?;
    if out.is_empty() {
        return Err("decompressed to empty data".to_string());
    }
    if out.len() as u64 > MAX_DECOMPRESSED_BYTES {
        return Err(format!("decompressed payload exceeds {} bytes", MAX_DECOMPRESSED_BYTES));
    }
    Ok(out)
}

/// Factory for creating decompressors
pub fn create_decompressor(format: CompressionFormat) -> Box<dyn PayloadDecompressor> {
    match format {
        CompressionFormat::Gzip => Box::new(GzipDecompressor),
        CompressionFormat::Zlib => Box::new(ZlibDecompressor),
        CompressionFormat::RawDeflate => Box::new(RawDeflateDecompressor),
    }
}
