// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Incremental decoder for the AWS binary event-stream framing used by the
//! Amazon Q / CodeWhisperer streaming chat endpoint.
//!
//! Frame layout: a 12-byte prelude (big-endian `total_len` u32, `headers_len`
//! u32, prelude CRC u32), `headers_len` bytes of typed headers, the payload,
//! and a trailing 4-byte message CRC.  The decoder is a stateful feeder —
//! callers push arbitrary byte chunks and receive every frame that became
//! complete; a partial tail is retained for the next call.
//!
//! CRCs are carried in the frame but not validated: the upstream connection
//! is TLS and a frame that fails CRC would have failed the TLS record first.
//! A prelude whose `total_len` is below the 16-byte minimum marks stream
//! misalignment; the decoder advances one byte and resynchronizes.

use thiserror::Error;

/// Minimum size of a complete frame: prelude (12) + message CRC (4).
const MIN_FRAME_LEN: usize = 16;
const PRELUDE_LEN: usize = 12;
const MESSAGE_CRC_LEN: usize = 4;

/// Typed value of one event-stream header entry.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(u8),
    Short(i16),
    Int(i32),
    Long(i64),
    Bytes(Vec<u8>),
    String(String),
    Timestamp(u64),
    Uuid([u8; 16]),
}

/// One decoded event: its header map and raw payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub headers: Vec<(String, HeaderValue)>,
    pub payload: Vec<u8>,
}

impl Event {
    /// Value of the `:event-type` header, when present and a string.
    pub fn event_type(&self) -> Option<&str> {
        self.header_str(":event-type")
    }

    /// Value of the `:message-type` header, when present and a string.
    pub fn message_type(&self) -> Option<&str> {
        self.header_str(":message-type")
    }

    fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|(k, v)| {
            if k == name {
                match v {
                    HeaderValue::String(s) => Some(s.as_str()),
                    _ => None,
                }
            } else {
                None
            }
        })
    }

    /// Parse the payload as JSON.
    pub fn payload_json(&self) -> Result<serde_json::Value, DecodeError> {
        serde_json::from_slice(&self.payload).map_err(|e| DecodeError::Payload(e.to_string()))
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("header block overruns frame (headers_len {headers_len}, total_len {total_len})")]
    HeaderOverrun { headers_len: usize, total_len: usize },
    #[error("truncated header entry at offset {0}")]
    TruncatedHeader(usize),
    #[error("unknown header value type {0}")]
    UnknownHeaderType(u8),
    #[error("header name is not valid UTF-8")]
    HeaderName,
    #[error("string header value is not valid UTF-8")]
    HeaderString,
    #[error("payload is not valid JSON: {0}")]
    Payload(String),
}

/// Stateful incremental frame decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered bytes awaiting frame completion.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Push bytes into the decoder, returning every frame that completed.
    ///
    /// Splitting the input into arbitrary chunks yields the same event list
    /// as feeding it whole; no event is emitted before its final byte has
    /// arrived.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Event>, DecodeError> {
        self.buf.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut offset = 0usize;

        loop {
            let remaining = &self.buf[offset..];
            if remaining.len() < PRELUDE_LEN {
                break;
            }

            let total_len = u32_be(&remaining[0..4]) as usize;
            let headers_len = u32_be(&remaining[4..8]) as usize;
            // remaining[8..12] is the prelude CRC — skipped, see module docs.

            if total_len < MIN_FRAME_LEN {
                // Misaligned stream: resync by advancing a single byte.
                offset += 1;
                continue;
            }
            if headers_len + PRELUDE_LEN + MESSAGE_CRC_LEN > total_len {
                return Err(DecodeError::HeaderOverrun {
                    headers_len,
                    total_len,
                });
            }
            if remaining.len() < total_len {
                break;
            }

            let headers = parse_headers(&remaining[PRELUDE_LEN..PRELUDE_LEN + headers_len])?;
            let payload_end = total_len - MESSAGE_CRC_LEN;
            let payload = remaining[PRELUDE_LEN + headers_len..payload_end].to_vec();
            // remaining[payload_end..total_len] is the message CRC — skipped.

            events.push(Event { headers, payload });
            offset += total_len;
        }

        self.buf.drain(..offset);
        Ok(events)
    }
}

/// Parse the header block: repeated `{u8 name_len, name, u8 type, value}`.
fn parse_headers(mut block: &[u8]) -> Result<Vec<(String, HeaderValue)>, DecodeError> {
    let total = block.len();
    let mut headers = Vec::new();

    while !block.is_empty() {
        let consumed = total - block.len();
        let name_len = block[0] as usize;
        if block.len() < 1 + name_len + 1 {
            return Err(DecodeError::TruncatedHeader(consumed));
        }
        let name = std::str::from_utf8(&block[1..1 + name_len])
            .map_err(|_| DecodeError::HeaderName)?
            .to_string();
        let value_type = block[1 + name_len];
        block = &block[1 + name_len + 1..];

        let (value, used) = parse_header_value(value_type, block)
            .ok_or(DecodeError::TruncatedHeader(consumed))??;
        block = &block[used..];
        headers.push((name, value));
    }

    Ok(headers)
}

/// Decode one header value.  Returns `None` when `block` is too short for the
/// declared type, `Some(Err(..))` for malformed content, and the number of
/// bytes consumed on success.
#[allow(clippy::type_complexity)]
fn parse_header_value(
    value_type: u8,
    block: &[u8],
) -> Option<Result<(HeaderValue, usize), DecodeError>> {
    let take = |n: usize| -> Option<&[u8]> {
        if block.len() < n {
            None
        } else {
            Some(&block[..n])
        }
    };

    let out = match value_type {
        0 => (HeaderValue::Bool(true), 0),
        1 => (HeaderValue::Bool(false), 0),
        2 => (HeaderValue::Byte(take(1)?[0]), 1),
        3 => (HeaderValue::Short(i16::from_be_bytes(take(2)?.try_into().ok()?)), 2),
        4 => (HeaderValue::Int(i32::from_be_bytes(take(4)?.try_into().ok()?)), 4),
        5 => (HeaderValue::Long(i64::from_be_bytes(take(8)?.try_into().ok()?)), 8),
        6 => {
            let len = u16::from_be_bytes(take(2)?.try_into().ok()?) as usize;
            let data = if block.len() < 2 + len {
                return None;
            } else {
                block[2..2 + len].to_vec()
            };
            (HeaderValue::Bytes(data), 2 + len)
        }
        7 => {
            let len = u16::from_be_bytes(take(2)?.try_into().ok()?) as usize;
            if block.len() < 2 + len {
                return None;
            }
            let s = match std::str::from_utf8(&block[2..2 + len]) {
                Ok(s) => s.to_string(),
                Err(_) => return Some(Err(DecodeError::HeaderString)),
            };
            (HeaderValue::String(s), 2 + len)
        }
        8 => (
            HeaderValue::Timestamp(u64::from_be_bytes(take(8)?.try_into().ok()?)),
            8,
        ),
        9 => {
            let bytes: [u8; 16] = take(16)?.try_into().ok()?;
            (HeaderValue::Uuid(bytes), 16)
        }
        other => return Some(Err(DecodeError::UnknownHeaderType(other))),
    };
    Some(Ok(out))
}

fn u32_be(bytes: &[u8]) -> u32 {
    u32::from_be_bytes(bytes.try_into().expect("caller supplies 4 bytes"))
}

// ─── Frame construction (tests and fixtures) ──────────────────────────────────

/// Serialize a frame from headers and payload.  CRC fields are written as
/// zeros — the decoder never checks them.  Lives outside `#[cfg(test)]` so
/// downstream crates can build fixture streams in their own tests.
pub fn encode_frame(headers: &[(&str, HeaderValue)], payload: &[u8]) -> Vec<u8> {
    let mut header_block = Vec::new();
    for (name, value) in headers {
        header_block.push(name.len() as u8);
        header_block.extend_from_slice(name.as_bytes());
        match value {
            HeaderValue::Bool(true) => header_block.push(0),
            HeaderValue::Bool(false) => header_block.push(1),
            HeaderValue::Byte(b) => {
                header_block.push(2);
                header_block.push(*b);
            }
            HeaderValue::Short(v) => {
                header_block.push(3);
                header_block.extend_from_slice(&v.to_be_bytes());
            }
            HeaderValue::Int(v) => {
                header_block.push(4);
                header_block.extend_from_slice(&v.to_be_bytes());
            }
            HeaderValue::Long(v) => {
                header_block.push(5);
                header_block.extend_from_slice(&v.to_be_bytes());
            }
            HeaderValue::Bytes(b) => {
                header_block.push(6);
                header_block.extend_from_slice(&(b.len() as u16).to_be_bytes());
                header_block.extend_from_slice(b);
            }
            HeaderValue::String(s) => {
                header_block.push(7);
                header_block.extend_from_slice(&(s.len() as u16).to_be_bytes());
                header_block.extend_from_slice(s.as_bytes());
            }
            HeaderValue::Timestamp(t) => {
                header_block.push(8);
                header_block.extend_from_slice(&t.to_be_bytes());
            }
            HeaderValue::Uuid(u) => {
                header_block.push(9);
                header_block.extend_from_slice(u);
            }
        }
    }

    let total_len = PRELUDE_LEN + header_block.len() + payload.len() + MESSAGE_CRC_LEN;
    let mut frame = Vec::with_capacity(total_len);
    frame.extend_from_slice(&(total_len as u32).to_be_bytes());
    frame.extend_from_slice(&(header_block.len() as u32).to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes()); // prelude CRC
    frame.extend_from_slice(&header_block);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&0u32.to_be_bytes()); // message CRC
    frame
}

/// Build the standard event frame shape used by the Amazon Q chat stream.
pub fn encode_event(event_type: &str, payload: &serde_json::Value) -> Vec<u8> {
    let body = serde_json::to_vec(payload).expect("JSON value always serializes");
    encode_frame(
        &[
            (":message-type", HeaderValue::String("event".into())),
            (":event-type", HeaderValue::String(event_type.into())),
            (":content-type", HeaderValue::String("application/json".into())),
        ],
        &body,
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
