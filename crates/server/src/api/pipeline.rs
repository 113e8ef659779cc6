// Request pipeline middleware, outermost first:
// request context -> panic capture -> body limit -> project headers
// -> session -> admission gate -> handler.

use std::time::Instant;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chronicle_common::protocol::{Endpoint, PROJECT_ID_HEADER, SNAPSHOT_CHECKSUM_HEADER};
use chronicle_common::types::{Checksum, ProjectId, UserId};
use tracing::{error, info};

use crate::admission::AdmissionController;
use crate::error::{
    attach_request_id_header, current_request_id, request_id_from_headers_or_generate, with_request_id_scope,
    ErrorCode, ServerError,
};
use crate::session::SessionCache;

/// Project metadata every project-scoped request must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectHeaders {
    pub project_id: ProjectId,
    pub snapshot_checksum: Checksum,
}

/// The authenticated caller, resolved from the session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub user_name: String,
    pub session_key: String,
}

pub async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}

pub async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    // Task-locals do not cross `tokio::spawn`.
    let request_id = current_request_id();
    let task = async move {
        match request_id {
            Some(request_id) => with_request_id_scope(request_id, next.run(request)).await,
            None => next.run(request).await,
        }
    };

    match tokio::spawn(task).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            ServerError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

pub async fn require_project_headers(mut request: Request, next: Next) -> Result<Response, ServerError> {
    let required = Endpoint::from_path(request.uri().path()).is_some_and(Endpoint::requires_project_headers);
    if required {
        let headers = parse_project_headers(request.headers())?;
        request.extensions_mut().insert(headers);
    }
    Ok(next.run(request).await)
}

fn parse_project_headers(headers: &HeaderMap) -> Result<ProjectHeaders, ServerError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ServerError::new(ErrorCode::BadRequest, format!("missing `{name}` header")))
    };

    let project_id = ProjectId::new(header(PROJECT_ID_HEADER)?)
        .map_err(|err| ServerError::new(ErrorCode::BadRequest, err.to_string()))?;
    let snapshot_checksum = Checksum::from_hex(header(SNAPSHOT_CHECKSUM_HEADER)?);
    Ok(ProjectHeaders { project_id, snapshot_checksum })
}

pub async fn require_session(
    State(sessions): State<SessionCache>,
    mut request: Request,
    next: Next,
) -> Result<Response, ServerError> {
    let session_key = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .map(ToOwned::to_owned)
        .ok_or_else(|| ServerError::new(ErrorCode::Unauthorized, "missing session key"))?;

    let token = sessions.get(&session_key).await?;
    request.extensions_mut().insert(Caller { user_id: token.user_id, user_name: token.user_name, session_key });

    Ok(next.run(request).await)
}

pub async fn admission_gate(
    State(admission): State<AdmissionController>,
    request: Request,
    next: Next,
) -> Result<Response, ServerError> {
    let Some(endpoint) = Endpoint::from_path(request.uri().path()) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let caller = request
        .extensions()
        .get::<Caller>()
        .ok_or_else(|| ServerError::from_code(ErrorCode::Unauthorized))?;
    let project = request.extensions().get::<ProjectHeaders>().map(|headers| &headers.project_id);

    admission.admit(endpoint, &caller.user_id, project).await?;
    Ok(next.run(request).await)
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

#[cfg(test)]
mod tests {
    use axum::{http::HeaderValue, middleware, routing::post, Extension, Router};
    use tower::ServiceExt;

    use super::*;
    use crate::session::AuthToken;

    #[test]
    fn bearer_token_parsing() {
        assert_eq!(extract_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("bearer  abc "), Some("abc"));
        assert_eq!(extract_bearer_token("Basic abc"), None);
        assert_eq!(extract_bearer_token("Bearer "), None);
        assert_eq!(extract_bearer_token("Bearer"), None);
    }

    #[test]
    fn project_headers_require_both_values() {
        let mut headers = HeaderMap::new();
        headers.insert(PROJECT_ID_HEADER, HeaderValue::from_static("pizza"));
        let err = parse_project_headers(&headers).expect_err("checksum missing");
        assert_eq!(err.code(), ErrorCode::BadRequest);

        headers.insert(SNAPSHOT_CHECKSUM_HEADER, HeaderValue::from_static("abc123"));
        let parsed = parse_project_headers(&headers).expect("both present");
        assert_eq!(parsed.project_id.as_str(), "pizza");
        assert_eq!(parsed.snapshot_checksum.as_str(), "abc123");

        headers.insert(PROJECT_ID_HEADER, HeaderValue::from_static("  "));
        assert!(parse_project_headers(&headers).is_err());
    }

    fn session_app(sessions: SessionCache) -> Router {
        Router::new()
            .route(
                "/whoami",
                post(|Extension(caller): Extension<Caller>| async move { caller.user_id.to_string() }),
            )
            .layer(middleware::from_fn_with_state(sessions, require_session))
    }

    #[tokio::test]
    async fn session_middleware_rejects_unknown_keys() {
        let response = session_app(SessionCache::default())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/whoami")
                    .header(AUTHORIZATION, "Bearer nope")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn session_middleware_injects_caller() {
        let sessions = SessionCache::default();
        let user = UserId::new("alice").expect("user");
        sessions.put("key-1", AuthToken::new(user, "Alice")).await;

        let response = session_app(sessions)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/whoami")
                    .header(AUTHORIZATION, "Bearer key-1")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("body");
        assert_eq!(&body[..], b"alice");
    }
}
