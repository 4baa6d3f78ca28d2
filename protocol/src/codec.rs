//! # Advertisement Payload Codec
//!
//! Transfer messages ride in the manufacturer-specific data field of a
//! broadcast advertisement, which leaves very little room. The layout is
//! fixed and has no version byte:
//!
//! ```text
//! ┌────────────────────────┬──────────┬────────────────────────┐
//! │ transfer_id (16 bytes) │ len (1B) │ data (len bytes, UTF-8)│
//! └────────────────────────┴──────────┴────────────────────────┘
//! ```
//!
//! The id field is space-padded on the right. Ids longer than 16 bytes are
//! cut at the last UTF-8 character boundary that fits; data longer than
//! 255 bytes is cut the same way. Both truncations are lossy on purpose:
//! the broadcast field simply cannot carry more.
//!
//! Request and confirmation payloads share this layout. Which one a
//! payload is depends on the service tag it was advertised under, not on
//! anything inside the bytes.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::config::{
    CONFIRMED_MARKER, MAX_PAYLOAD_DATA_LEN, PAYLOAD_HEADER_LEN, REJECTED_MARKER, TRANSFER_ID_LEN,
    TRANSFER_ID_PAD,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Malformed {
    /// Fewer bytes than the fixed header.
    #[error("{len} bytes is shorter than the {}-byte header", PAYLOAD_HEADER_LEN)]
    TooShort { len: usize },
    /// The length prefix points past the end of the buffer.
    #[error("declared data length {declared} exceeds the {remaining} bytes remaining")]
    LengthOverrun { declared: usize, remaining: usize },
    /// A text field is not valid UTF-8.
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
}

/// Errors produced by [`decode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The buffer does not hold a well-formed payload.
    #[error("malformed payload: {0}")]
    MalformedPayload(Malformed),
}

// ---------------------------------------------------------------------------
// TransferPayload
// ---------------------------------------------------------------------------

/// A decoded advertisement payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPayload {
    /// Transfer id, padding removed.
    pub transfer_id: String,
    /// Request reason or confirmation marker.
    pub data: String,
}

impl TransferPayload {
    pub fn new(transfer_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            data: data.into(),
        }
    }

    /// Payload for a confirmation message.
    pub fn confirmation(transfer_id: impl Into<String>, confirmed: bool) -> Self {
        let marker = if confirmed {
            CONFIRMED_MARKER
        } else {
            REJECTED_MARKER
        };
        Self::new(transfer_id, marker)
    }

    /// Interprets `data` as a confirmation marker. Anything other than the
    /// exact "confirmed" marker counts as a rejection.
    pub fn is_confirmed(&self) -> bool {
        self.data == CONFIRMED_MARKER
    }

    pub fn encode(&self) -> Bytes {
        encode(&self.transfer_id, &self.data)
    }
}

// ---------------------------------------------------------------------------
// Encode / Decode
// ---------------------------------------------------------------------------

/// Encodes a transfer id and data section into the fixed wire layout.
///
/// Never fails. Oversized fields are truncated at a character boundary.
pub fn encode(transfer_id: &str, data: &str) -> Bytes {
    let id = truncate_utf8(transfer_id, TRANSFER_ID_LEN);
    let data = truncate_utf8(data, MAX_PAYLOAD_DATA_LEN);

    let mut buf = BytesMut::with_capacity(PAYLOAD_HEADER_LEN + data.len());
    buf.put_slice(id.as_bytes());
    buf.put_bytes(TRANSFER_ID_PAD, TRANSFER_ID_LEN - id.len());
    buf.put_u8(data.len() as u8);
    buf.put_slice(data.as_bytes());
    buf.freeze()
}

/// Decodes a payload produced by [`encode`].
///
/// Bytes after the declared data section are ignored; radio stacks are
/// free to pad the manufacturer field.
///
/// # Errors
///
/// Returns [`CodecError::MalformedPayload`] if the buffer is shorter than
/// the 17-byte header, if the length prefix overruns the buffer, or if
/// either text field is not UTF-8.
pub fn decode(bytes: &[u8]) -> Result<TransferPayload, CodecError> {
    if bytes.len() < PAYLOAD_HEADER_LEN {
        return Err(CodecError::MalformedPayload(Malformed::TooShort {
            len: bytes.len(),
        }));
    }

    let declared = bytes[TRANSFER_ID_LEN] as usize;
    let remaining = bytes.len() - PAYLOAD_HEADER_LEN;
    if declared > remaining {
        return Err(CodecError::MalformedPayload(Malformed::LengthOverrun {
            declared,
            remaining,
        }));
    }

    let id = std::str::from_utf8(&bytes[..TRANSFER_ID_LEN]).map_err(|_| {
        CodecError::MalformedPayload(Malformed::InvalidUtf8 {
            field: "transfer_id",
        })
    })?;
    let data = std::str::from_utf8(&bytes[PAYLOAD_HEADER_LEN..PAYLOAD_HEADER_LEN + declared])
        .map_err(|_| CodecError::MalformedPayload(Malformed::InvalidUtf8 { field: "data" }))?;

    Ok(TransferPayload {
        transfer_id: id.trim_end_matches(TRANSFER_ID_PAD as char).to_string(),
        data: data.to_string(),
    })
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
