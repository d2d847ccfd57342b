// Text decoding of decompressed payloads

use std::fmt;

use serde_json::Value;

/// Order in which encodings are tried. The service's encoding is not known up front.
pub const ENCODING_CASCADE: [TextEncoding; 4] = [
    TextEncoding::Utf8,
    TextEncoding::Utf16Le,
    TextEncoding::Utf16Be,
    TextEncoding::Latin1,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
    Utf16Be,
    Latin1,
}

impl TextEncoding {
    pub fn name(&self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Utf16Le => "utf-16le",
            TextEncoding::Utf16Be => "utf-16be",
            TextEncoding::Latin1 => "iso-8859-1",
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<String, String> {
        let text = match self {
            TextEncoding::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|e| e.to_string())?,
            TextEncoding::Utf16Le => decode_utf16(bytes, u16::from_le_bytes)?,
            TextEncoding::Utf16Be => decode_utf16(bytes, u16::from_be_bytes)?,
            TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        };
        Ok(text.strip_prefix('\u{feff}').map(str::to_owned).unwrap_or(text))
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> Result<String, String> {
    if bytes.len() % 2 != 0 {
        return Err(format!("odd byte length {}", bytes.len()));
    }
    let units = bytes.chunks_exact(2).map(|pair| unit([pair[0], pair[1]]));
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .map_err(|e| e.to_string())
}

/// Accepts decoded text only when it looks like a JSON document and parses as one.
pub fn parse_json_text(text: &str) -> Result<Value, String> {
    let trimmed = text.trim();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        let preview: String = trimmed.chars().take(16).collect();
        return Err(format!("does not start with a JSON document: {:?}", preview));
    }
    serde_json::from_str(trimmed).map_err(|e| e.to_string())
}

/// One encoding attempt: decode, then require valid JSON.
pub fn decode_json_as(encoding: TextEncoding, bytes: &[u8]) -> Result<Value, String> {
    encoding.decode(bytes).and_then(|text| parse_json_text(&text))
}
