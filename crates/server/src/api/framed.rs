// Framed request and response bodies.

use axum::{
    body::Bytes,
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chronicle_common::protocol::frame::{append_frame, FrameReader, FrameTag, FRAME_CONTENT_TYPE};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::ServerError;

/// A successful response made of one or more frames.
#[derive(Debug, Default)]
pub struct Framed {
    bytes: Vec<u8>,
}

impl Framed {
    pub fn single<T: Serialize>(tag: FrameTag, message: &T) -> Result<Self, ServerError> {
        Self::default().then(tag, message)
    }

    pub fn then<T: Serialize>(mut self, tag: FrameTag, message: &T) -> Result<Self, ServerError> {
        append_frame(&mut self.bytes, tag, message).map_err(ServerError::internal)?;
        Ok(self)
    }

    pub fn ack() -> Result<Self, ServerError> {
        Self::single(FrameTag::Ack, &())
    }
}

impl IntoResponse for Framed {
    fn into_response(self) -> Response {
        (StatusCode::OK, [(CONTENT_TYPE, HeaderValue::from_static(FRAME_CONTENT_TYPE))], self.bytes)
            .into_response()
    }
}

/// Decode a body holding exactly one frame.
pub fn decode_body<T: DeserializeOwned>(body: &Bytes, tag: FrameTag) -> Result<T, ServerError> {
    Ok(chronicle_common::protocol::frame::decode_single(body, tag)?)
}

/// Decode a body holding exactly two frames, in order.
pub fn decode_pair<A: DeserializeOwned, B: DeserializeOwned>(
    body: &Bytes,
    first: FrameTag,
    second: FrameTag,
) -> Result<(A, B), ServerError> {
    let mut reader = FrameReader::new(body);
    let a = reader.expect(first)?;
    let b = reader.expect(second)?;
    reader.finish()?;
    Ok((a, b))
}
