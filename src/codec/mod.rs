// Inbound frame decoding
//
// A frame that declares itself compressed carries base64 bytes of unknown format and
// unknown text encoding. Every format (sniffed one first) is tried against every
// encoding until one yields a JSON document.
pub mod compress;
pub mod text;

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{MessageEnvelope, ServerMessage};
pub use compress::{create_decompressor, CompressionFormat, PayloadDecompressor};
pub use text::{TextEncoding, ENCODING_CASCADE};

/// One failed strategy inside a cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub strategy: String,
    pub reason: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.strategy, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("frame is not JSON: {0}")]
    Json(String),

    #[error("compressed frame carries no payload")]
    MissingPayload,

    #[error("payload is not valid base64: {0}")]
    Base64(String),

    #[error("no format/encoding combination produced JSON (header {header}): {}", join(.attempts))]
    Integrity {
        header: String,
        attempts: Vec<AttemptFailure>,
    },

    #[error("malformed {kind} message: {reason}")]
    Protocol { kind: String, reason: String },
}

fn join(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Runs `attempt` over `strategies` in order, returning the first success or every
/// failure reason.
pub fn cascade<S, T, I>(
    strategies: I,
    mut attempt: impl FnMut(&S) -> Result<T, String>,
) -> Result<(S, T), Vec<AttemptFailure>>
where
    I: IntoIterator<Item = S>,
    S: fmt::Display,
{
    let mut failures = Vec::new();
    for strategy in strategies {
        match attempt(&strategy) {
            Ok(value) => return Ok((strategy, value)),
            Err(reason) => failures.push(AttemptFailure {
                strategy: strategy.to_string(),
                reason,
            }),
        }
    }
    Err(failures)
}

/// Decode one raw frame into a typed message.
pub fn decode(raw: &str) -> Result<ServerMessage, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| DecodeError::Json(e.to_string()))?;

    let value = match MessageEnvelope::from_value(&value) {
        Some(envelope) if envelope.is_compressed() => unwrap_envelope(&envelope)?,
        _ => value,
    };

    into_message(value)
}

/// Recover the JSON document wrapped by a compressed envelope.
pub fn unwrap_envelope(envelope: &MessageEnvelope) -> Result<Value, DecodeError> {
    let data = envelope
        .data
        .as_deref()
        .filter(|d| !d.is_empty())
        .ok_or(DecodeError::MissingPayload)?;
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| DecodeError::Base64(e.to_string()))?;

    debug!(
        "Codec: decompressing {:?} payload, {} bytes (declared {:?} -> {:?})",
        envelope.encoding,
        bytes.len(),
        envelope.compressed_size,
        envelope.original_size
    );

    decompress_json(&bytes)
}

/// Format x encoding cascade over raw compressed bytes.
pub fn decompress_json(bytes: &[u8]) -> Result<Value, DecodeError> {
    let result = cascade(CompressionFormat::cascade(bytes), |format| {
        let decompressed = create_decompressor(*format).decompress(bytes)?;
        cascade(ENCODING_CASCADE, |encoding| text::decode_json_as(*encoding, &decompressed))
            .map(|(encoding, value)| {
                debug!(
                    "Codec: recovered JSON with {} / {} ({} bytes)",
                    format,
                    encoding,
                    decompressed.len()
                );
                value
            })
            .map_err(|failures| format!("no encoding matched ({})", join(&failures)))
    });

    result.map(|(_, value)| value).map_err(|attempts| {
        let header = hex::encode(&bytes[..bytes.len().min(4)]);
        warn!("Codec: all decompression formats failed, header {}", header);
        DecodeError::Integrity { header, attempts }
    })
}

/// Map a plain JSON document onto a message kind.
pub fn into_message(value: Value) -> Result<ServerMessage, DecodeError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let message = match kind.as_str() {
        "pmon" => ServerMessage::Pmon(typed(&kind, value)?),
        "deployment" => ServerMessage::Deployment(typed(&kind, value)?),
        "log" => ServerMessage::Log(typed(&kind, value)?),
        "logContent" => ServerMessage::LogContent(typed(&kind, value)?),
        "logFiles" => ServerMessage::LogFiles(typed(&kind, value)?),
        "heartbeat" => ServerMessage::Heartbeat,
        "notification" => ServerMessage::Notification(typed(&kind, value)?),
        "error" => ServerMessage::Error(typed(&kind, value)?),
        _ => ServerMessage::Unknown { kind },
    };
    Ok(message)
}

fn typed<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::Protocol {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}
