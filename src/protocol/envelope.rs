// Outer wrapper that may declare a frame's payload compressed

use serde::Deserialize;
use serde_json::Value;

/// `{type, compressed, encoding, data, compressedSize, originalSize}` as sent by the server.
/// Only meaningful while one frame is being processed.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageEnvelope {
    #[serde(rename = "type")]
    pub message_type: Option<String>,
    pub compressed: bool,
    /// Hint from the server (usually "gzip"); the codec sniffs the real format anyway.
    pub encoding: Option<String>,
    /// Base64 of the compressed bytes.
    pub data: Option<String>,
    pub compressed_size: Option<u64>,
    pub original_size: Option<u64>,
}

impl MessageEnvelope {
    /// Reads the envelope fields out of a parsed frame. Frames whose fields do not
    /// have envelope shape are treated as plain messages.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }
}
