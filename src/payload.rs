//! Payload text decoding.
//!
//! Decoded text is a convenience view; the raw bytes travel alongside it unchanged.

use base64::Engine;
use serde::{Serialize, Serializer};

/// Text encoding used to derive `text` from `raw_bytes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Utf8,
    /// ISO-8859-1
    Latin1,
}

impl Encoding {
    /// Re-encode `text` under this encoding.
    ///
    /// Returns `None` if `text` holds a character outside Latin-1 when encoding as Latin-1.
    pub fn encode(self, text: &str) -> Option<Vec<u8>> {
        match self {
            Encoding::Utf8 => Some(text.as_bytes().to_vec()),
            Encoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).ok())
                .collect(),
        }
    }
}

/// Decode raw payload bytes to text.
///
/// Strict UTF-8 first; anything that is not valid UTF-8 is read as ISO-8859-1, which maps every
/// byte to the code point of the same value and so cannot fail.
pub fn normalize(raw: &[u8]) -> (String, Encoding) {
    match std::str::from_utf8(raw) {
        Ok(text) => (text.to_string(), Encoding::Utf8),
        Err(_) => (raw.iter().map(|&b| b as char).collect(), Encoding::Latin1),
    }
}

pub(crate) fn serialize_base64<S: Serializer>(bytes: &bytes::Bytes, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
}
