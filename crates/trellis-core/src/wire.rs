//! Trellis wire format: rows and the reference grammar.
//!
//! A stream is a sequence of newline-terminated rows:
//!
//! ```text
//! <decimal-id> ':' <tag> <json-payload> '\n'
//! ```
//!
//! Payloads are compact JSON, so string escaping guarantees a payload never
//! contains a raw newline. Inside string positions a leading `$` or `@`
//! marks a reference; literal strings that start with either are escaped
//! with one extra `$`.

use std::borrow::Cow;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Chunk identifier. Assigned by the writer, observed by the reader.
pub type ChunkId = u64;

/// The chunk the consumer reads first.
pub const ROOT_ID: ChunkId = 0;

/// Prefix of a chunk reference inside a string position.
pub const REF_SENTINEL: char = '$';

/// Prefix of an external-module reference inside a string position.
pub const MODULE_SENTINEL: char = '@';

// ── Row tags ──────────────────────────────────────────────────────────────────

/// Row kind. The tag byte follows the `:` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowTag {
    /// `J`: the chunk's final value.
    Model,
    /// `P`: one streamed part. Non-terminal.
    Part,
    /// `M`: external-module metadata.
    Module,
    /// `E`: the chunk failed.
    Error,
}

impl RowTag {
    pub fn as_byte(self) -> u8 {
        match self {
            RowTag::Model => b'J',
            RowTag::Part => b'P',
            RowTag::Module => b'M',
            RowTag::Error => b'E',
        }
    }

    /// Terminal rows settle a chunk; nothing for that id matters afterwards.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RowTag::Part)
    }
}

impl TryFrom<u8> for RowTag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            b'J' => Ok(RowTag::Model),
            b'P' => Ok(RowTag::Part),
            b'M' => Ok(RowTag::Module),
            b'E' => Ok(RowTag::Error),
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

// ── Rows ──────────────────────────────────────────────────────────────────────

/// One decoded row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: ChunkId,
    pub tag: RowTag,
    pub payload: serde_json::Value,
}

impl Row {
    pub fn new(id: ChunkId, tag: RowTag, payload: serde_json::Value) -> Self {
        Self { id, tag, payload }
    }

    pub fn encode(&self) -> Bytes {
        encode_row(self.id, self.tag, &self.payload)
    }
}

/// Payload of an `E` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Stable short hash of the original message. Survives redaction.
    pub digest: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorPayload {
    /// JSON form for an `E` row. Built by hand so it cannot fail.
    pub fn to_value(&self) -> serde_json::Value {
        let mut fields = serde_json::Map::new();
        fields.insert("digest".into(), self.digest.clone().into());
        fields.insert("message".into(), self.message.clone().into());
        if let Some(stack) = &self.stack {
            fields.insert("stack".into(), stack.clone().into());
        }
        serde_json::Value::Object(fields)
    }
}

/// Serialize one row, trailing newline included.
pub fn encode_row(id: ChunkId, tag: RowTag, payload: &serde_json::Value) -> Bytes {
    // Value's Display is compact JSON and cannot fail.
    let text = format!("{id}:{}{payload}\n", tag.as_byte() as char);
    Bytes::from(text)
}

/// Parse a single row without its trailing newline.
pub fn decode_row(line: &[u8]) -> Result<Row, WireError> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(WireError::MissingSeparator)?;

    let id_text = std::str::from_utf8(&line[..colon])
        .map_err(|_| WireError::InvalidId(String::from_utf8_lossy(&line[..colon]).into_owned()))?;
    if id_text.is_empty() || !id_text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(WireError::InvalidId(id_text.to_string()));
    }
    let id: ChunkId = id_text
        .parse()
        .map_err(|_| WireError::InvalidId(id_text.to_string()))?;

    let tag = *line.get(colon + 1).ok_or(WireError::MissingTag(id))?;
    let tag = RowTag::try_from(tag)?;

    let payload = serde_json::from_slice(&line[colon + 2..])
        .map_err(|e| WireError::InvalidPayload(id, e.to_string()))?;

    Ok(Row { id, tag, payload })
}

// ── Incremental decoder ───────────────────────────────────────────────────────

/// Splits an arbitrarily fragmented byte stream into rows.
///
/// Bytes are buffered until a newline arrives; a trailing partial row is
/// kept for the next `push`. Already-scanned bytes are never rescanned, so
/// a row delivered one byte at a time costs linear time.
#[derive(Debug, Default)]
pub struct RowDecoder {
    buf: BytesMut,
    scanned: usize,
}

impl RowDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes. Call `next_row` to drain complete rows.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode the next complete row, if one is buffered.
    pub fn next_row(&mut self) -> Result<Option<Row>, WireError> {
        match self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            Some(offset) => {
                let line = self.buf.split_to(self.scanned + offset + 1);
                self.scanned = 0;
                decode_row(&line[..line.len() - 1]).map(Some)
            }
            None => {
                self.scanned = self.buf.len();
                Ok(None)
            }
        }
    }

    /// Push bytes and decode every complete row now available.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Row>, WireError> {
        self.push(bytes);
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Bytes held back as an incomplete row.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Called at end of input. A leftover partial row means the stream was cut.
    pub fn finish(&self) -> Result<(), WireError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(WireError::TruncatedRow(self.buf.len()))
        }
    }
}

// ── Reference grammar ─────────────────────────────────────────────────────────

/// What a string in a payload stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel<'a> {
    Text(&'a str),
    Ref(ChunkId),
    Module(ChunkId),
}

/// `"$<id>"`
pub fn reference(id: ChunkId) -> String {
    format!("{REF_SENTINEL}{id}")
}

/// `"@<id>"`
pub fn module_reference(id: ChunkId) -> String {
    format!("{MODULE_SENTINEL}{id}")
}

/// Escape a literal string so the reader never mistakes it for a reference.
pub fn escape_text(text: &str) -> Cow<'_, str> {
    if text.starts_with(REF_SENTINEL) || text.starts_with(MODULE_SENTINEL) {
        Cow::Owned(format!("{REF_SENTINEL}{text}"))
    } else {
        Cow::Borrowed(text)
    }
}

/// Interpret a payload string: literal text, escaped text, or a reference.
pub fn parse_text(text: &str) -> Result<Sentinel<'_>, WireError> {
    let mut chars = text.chars();
    match chars.next() {
        Some(REF_SENTINEL) => match chars.next() {
            Some(REF_SENTINEL) | Some(MODULE_SENTINEL) => Ok(Sentinel::Text(&text[1..])),
            _ => parse_id(&text[1..], text).map(Sentinel::Ref),
        },
        Some(MODULE_SENTINEL) => parse_id(&text[1..], text).map(Sentinel::Module),
        _ => Ok(Sentinel::Text(text)),
    }
}

fn parse_id(digits: &str, original: &str) -> Result<ChunkId, WireError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(WireError::InvalidReference(original.to_string()));
    }
    digits
        .parse()
        .map_err(|_| WireError::InvalidReference(original.to_string()))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
/// Every one of them is fatal to the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("row has no ':' separator")]
    MissingSeparator,

    #[error("invalid chunk id {0:?}")]
    InvalidId(String),

    #[error("row {0} has no tag")]
    MissingTag(ChunkId),

    #[error("unknown row tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("row {0} has an invalid payload: {1}")]
    InvalidPayload(ChunkId, String),

    #[error("invalid reference {0:?}")]
    InvalidReference(String),

    #[error("stream ended inside a row ({0} bytes buffered)")]
    TruncatedRow(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
