use std::future::Future;

use axum::{
    http::{header::CONTENT_TYPE, header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chronicle_common::protocol::frame::{encode_frame, FrameError, FrameTag, FRAME_CONTENT_TYPE};
use chronicle_common::protocol::messages::ErrorBody;
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

use crate::admission::AdmissionError;
use crate::commit::CommitError;
use crate::compaction::CompactionError;
use crate::history::HistoryError;
use crate::session::SessionError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    NotFound,
    Conflict,
    SnapshotOutOfDate,
    MaintenanceMode,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::SnapshotOutOfDate => "SNAPSHOT_OUT_OF_DATE",
            Self::MaintenanceMode => "MAINTENANCE_MODE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::SnapshotOutOfDate => StatusCode::PRECONDITION_FAILED,
            Self::MaintenanceMode => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether resending the identical request could succeed. Conflicts are
    /// not retryable as-is; the client must resync and rebuild its baseline.
    pub const fn retryable(self) -> bool {
        matches!(self, Self::MaintenanceMode | Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::BadRequest => "request is missing required metadata",
            Self::Unauthorized => "caller is not authorized",
            Self::NotFound => "requested history not found",
            Self::Conflict => "commit baseline is out of sync",
            Self::SnapshotOutOfDate => "snapshot checksum is out of date",
            Self::MaintenanceMode => "server is in maintenance mode",
            Self::InternalError => "internal server error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl ServerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code.as_str().to_string(),
            message: self.message.clone(),
            retryable: self.code.retryable(),
            request_id: self.request_id.clone().or_else(current_request_id),
            details: self.details.clone(),
        }
    }

    pub(crate) fn internal(err: impl std::fmt::Display) -> Self {
        error!(error = %err, "request failed with internal error");
        Self::from_code(ErrorCode::InternalError)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let body = self.body();
        let request_id = body.request_id.clone();

        let mut response = match encode_frame(FrameTag::Error, &body) {
            Ok(bytes) => {
                (self.code.status(), [(CONTENT_TYPE, HeaderValue::from_static(FRAME_CONTENT_TYPE))], bytes)
                    .into_response()
            }
            Err(_) => (self.code.status(), self.message).into_response(),
        };

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }
        response
    }
}

impl From<HistoryError> for ServerError {
    fn from(err: HistoryError) -> Self {
        if err.is_not_found() {
            Self::new(ErrorCode::NotFound, err.to_string())
        } else {
            Self::internal(err)
        }
    }
}

impl From<CommitError> for ServerError {
    fn from(err: CommitError) -> Self {
        match err {
            CommitError::Conflict { submitted, current } => Self::from_code(ErrorCode::Conflict)
                .with_details(json!({ "submitted": submitted, "current": current })),
            CommitError::Unauthorized { .. } => Self::new(ErrorCode::Unauthorized, err.to_string()),
            CommitError::History(err) => err.into(),
        }
    }
}

impl From<CompactionError> for ServerError {
    fn from(err: CompactionError) -> Self {
        match err {
            CompactionError::SnapshotNotAtHead { snapshot, head } => {
                Self::new(ErrorCode::Conflict, err.to_string())
                    .with_details(json!({ "snapshot_revision": snapshot, "head": head }))
            }
            CompactionError::RolledBack(_) => Self::internal(err),
            CompactionError::History(err) => err.into(),
        }
    }
}

impl From<AdmissionError> for ServerError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Paused { pausing_user } => Self::from_code(ErrorCode::MaintenanceMode)
                .with_details(json!({ "pausing_user": pausing_user })),
        }
    }
}

impl From<SessionError> for ServerError {
    fn from(err: SessionError) -> Self {
        Self::new(ErrorCode::Unauthorized, err.to_string())
    }
}

impl From<FrameError> for ServerError {
    fn from(err: FrameError) -> Self {
        Self::new(ErrorCode::BadRequest, err.to_string())
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
