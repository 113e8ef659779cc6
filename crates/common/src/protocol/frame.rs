// Versioned binary framing for request and response bodies.
//
// Layout per frame:
//   [magic: 2 bytes "CF"][version: u8][tag: u8][len: u32 little-endian][payload: len bytes]
// The payload is the JSON encoding of the message named by the tag.
// A body may carry several frames back to back; readers consume them in order.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub const FRAME_MAGIC: [u8; 2] = *b"CF";
pub const FRAME_VERSION: u8 = 1;
pub const FRAME_HEADER_BYTES: usize = 8;
/// Payload cap; larger bodies are rejected before allocation.
pub const MAX_FRAME_PAYLOAD_BYTES: usize = 16 << 20;
pub const FRAME_CONTENT_TYPE: &str = "application/x-chronicle-frame";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    LoginRequest = 1,
    LoginResponse = 2,
    CommitBundle = 3,
    CommitReceipt = 4,
    HistoryFile = 5,
    Revision = 6,
    ChangeHistory = 7,
    Head = 8,
    Snapshot = 9,
    SquashReceipt = 10,
    Ack = 11,
    Error = 12,
}

impl FrameTag {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::LoginRequest,
            2 => Self::LoginResponse,
            3 => Self::CommitBundle,
            4 => Self::CommitReceipt,
            5 => Self::HistoryFile,
            6 => Self::Revision,
            7 => Self::ChangeHistory,
            8 => Self::Head,
            9 => Self::Snapshot,
            10 => Self::SquashReceipt,
            11 => Self::Ack,
            12 => Self::Error,
            _ => return None,
        })
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("frame has invalid magic bytes")]
    BadMagic,

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown frame tag {0}")]
    UnknownTag(u8),

    #[error("expected {expected:?} frame, got {actual:?}")]
    UnexpectedTag { expected: FrameTag, actual: FrameTag },

    #[error("frame payload of {0} bytes exceeds the maximum")]
    TooLarge(usize),

    #[error("{0} unexpected trailing bytes after the last frame")]
    TrailingBytes(usize),

    #[error("frame payload is not valid JSON for {tag:?}: {source}")]
    Payload {
        tag: FrameTag,
        #[source]
        source: serde_json::Error,
    },
}

/// Encode `message` as a single frame.
pub fn encode_frame<T: Serialize>(tag: FrameTag, message: &T) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::new();
    append_frame(&mut out, tag, message)?;
    Ok(out)
}

/// Encode `message` and append it to `out`.
pub fn append_frame<T: Serialize>(
    out: &mut Vec<u8>,
    tag: FrameTag,
    message: &T,
) -> Result<(), FrameError> {
    let payload = serde_json::to_vec(message).map_err(|source| FrameError::Payload { tag, source })?;
    if payload.len() > MAX_FRAME_PAYLOAD_BYTES {
        return Err(FrameError::TooLarge(payload.len()));
    }

    out.reserve(FRAME_HEADER_BYTES + payload.len());
    out.extend_from_slice(&FRAME_MAGIC);
    out.push(FRAME_VERSION);
    out.push(tag as u8);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(())
}

/// Decode a body that must contain exactly one frame of the given tag.
pub fn decode_single<T: DeserializeOwned>(bytes: &[u8], tag: FrameTag) -> Result<T, FrameError> {
    let mut reader = FrameReader::new(bytes);
    let message = reader.expect(tag)?;
    reader.finish()?;
    Ok(message)
}

/// Sequential decoder over a body of back-to-back frames.
#[derive(Debug)]
pub struct FrameReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Next raw frame, or `None` at end of input.
    pub fn next_frame(&mut self) -> Result<Option<(FrameTag, &'a [u8])>, FrameError> {
        let remaining = &self.bytes[self.offset..];
        if remaining.is_empty() {
            return Ok(None);
        }
        if remaining.len() < FRAME_HEADER_BYTES {
            return Err(FrameError::Truncated {
                expected: FRAME_HEADER_BYTES,
                actual: remaining.len(),
            });
        }
        if remaining[..2] != FRAME_MAGIC {
            return Err(FrameError::BadMagic);
        }
        if remaining[2] != FRAME_VERSION {
            return Err(FrameError::UnsupportedVersion(remaining[2]));
        }
        let tag = FrameTag::from_u8(remaining[3]).ok_or(FrameError::UnknownTag(remaining[3]))?;
        let len = u32::from_le_bytes([remaining[4], remaining[5], remaining[6], remaining[7]])
            as usize;
        if len > MAX_FRAME_PAYLOAD_BYTES {
            return Err(FrameError::TooLarge(len));
        }
        let total = FRAME_HEADER_BYTES + len;
        if remaining.len() < total {
            return Err(FrameError::Truncated { expected: total, actual: remaining.len() });
        }

        self.offset += total;
        Ok(Some((tag, &remaining[FRAME_HEADER_BYTES..total])))
    }

    /// Decode the next frame, which must carry `tag`.
    pub fn expect<T: DeserializeOwned>(&mut self, tag: FrameTag) -> Result<T, FrameError> {
        let (actual, payload) = self.next_frame()?.ok_or(FrameError::Truncated {
            expected: FRAME_HEADER_BYTES,
            actual: 0,
        })?;
        if actual != tag {
            return Err(FrameError::UnexpectedTag { expected: tag, actual });
        }
        serde_json::from_slice(payload).map_err(|source| FrameError::Payload { tag, source })
    }

    /// Fail if any bytes remain after the frames consumed so far.
    pub fn finish(self) -> Result<(), FrameError> {
        let trailing = self.bytes.len() - self.offset;
        if trailing == 0 {
            Ok(())
        } else {
            Err(FrameError::TrailingBytes(trailing))
        }
    }
}
