pub mod framed;
pub mod pipeline;

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Extension, Router,
};
use chronicle_common::history::ChangeHistory;
use chronicle_common::protocol::frame::FrameTag;
use chronicle_common::protocol::messages::{LoginRequest, LoginResponse};
use chronicle_common::protocol::{Endpoint, LOGIN_PATH, LOGOUT_PATH, PAUSE_PATH, RESUME_PATH};
use chronicle_common::types::{CommitBundle, DocumentRevision, HistoryFile, ProjectId, Snapshot};
use serde_json::json;
use tracing::info;

use crate::access::{AccessPolicy, Operation, StaticAccessPolicy};
use crate::admission::AdmissionController;
use crate::commit::CommitCoordinator;
use crate::compaction::CompactionManager;
use crate::error::{ErrorCode, ServerError};
use crate::history::{DocumentApplier, HistoryStore, ProjectHistory};
use crate::session::{generate_session_key, AuthToken, SessionCache};

use self::framed::{decode_body, decode_pair, Framed};
use self::pipeline::{
    admission_gate, panic_handler, request_context_middleware, require_project_headers, require_session, Caller,
    ProjectHeaders,
};

/// Large enough for one maximal frame plus framing overhead.
pub const MAX_REQUEST_BODY_BYTES: usize = 17 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<HistoryStore>,
    pub sessions: SessionCache,
    pub admission: AdmissionController,
    pub policy: Arc<StaticAccessPolicy>,
    pub commits: CommitCoordinator,
    pub compaction: CompactionManager,
    /// Replays coalesced changes when a document is materialized.
    pub applier: Arc<dyn DocumentApplier>,
}

impl AppState {
    pub fn new(
        store: Arc<HistoryStore>,
        policy: Arc<StaticAccessPolicy>,
        sessions: SessionCache,
        admission: AdmissionController,
        applier: Arc<dyn DocumentApplier>,
    ) -> Self {
        let commits = CommitCoordinator::new(Arc::clone(&store), policy.clone());
        let compaction = CompactionManager::new(Arc::clone(&store));
        Self { store, sessions, admission, policy, commits, compaction, applier }
    }
}

pub fn build_router(state: AppState) -> Router {
    let history = Router::new()
        .route(Endpoint::Commit.path(), post(commit))
        .route(Endpoint::Head.path(), post(head))
        .route(Endpoint::AllChanges.path(), post(all_changes))
        .route(Endpoint::LatestChanges.path(), post(latest_changes))
        .route(Endpoint::Squash.path(), post(squash))
        .route(Endpoint::Document.path(), post(document))
        .route_layer(middleware::from_fn_with_state(state.admission.clone(), admission_gate))
        .route_layer(middleware::from_fn_with_state(state.sessions.clone(), require_session))
        .route_layer(middleware::from_fn(require_project_headers));

    // Admin routes bypass the admission gate so a pause can always be lifted.
    let session = Router::new()
        .route(LOGOUT_PATH, post(logout))
        .route(PAUSE_PATH, post(pause))
        .route(RESUME_PATH, post(resume))
        .route_layer(middleware::from_fn_with_state(state.sessions.clone(), require_session))
        .route(LOGIN_PATH, post(login));

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(history)
            .merge(session)
            .with_state(state),
    )
}

pub fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(panic_handler))
        .layer(middleware::from_fn(request_context_middleware))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

fn authorize(
    state: &AppState,
    caller: &Caller,
    operation: Operation,
    project: Option<&ProjectId>,
) -> Result<(), ServerError> {
    if state.policy.is_authorized(&caller.user_id, operation, project) {
        Ok(())
    } else {
        Err(ServerError::new(
            ErrorCode::Unauthorized,
            format!("user `{}` may not perform {operation:?}", caller.user_id),
        ))
    }
}

/// Resolve the project and reject the request if the client's snapshot
/// checksum no longer names the active baseline.
async fn current_project(state: &AppState, headers: &ProjectHeaders) -> Result<Arc<ProjectHistory>, ServerError> {
    let project = state.store.project(&headers.project_id).await?;
    let current = project.snapshot_checksum().await;
    if current != headers.snapshot_checksum {
        return Err(ServerError::from_code(ErrorCode::SnapshotOutOfDate)
            .with_details(json!({ "submitted": headers.snapshot_checksum, "current": current })));
    }
    Ok(project)
}

fn ensure_same_project(file: &HistoryFile, headers: &ProjectHeaders) -> Result<(), ServerError> {
    if file.project_id == headers.project_id {
        Ok(())
    } else {
        Err(ServerError::new(
            ErrorCode::BadRequest,
            format!("history file `{}` does not match project header `{}`", file.project_id, headers.project_id),
        ))
    }
}

async fn commit(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Extension(headers): Extension<ProjectHeaders>,
    body: Bytes,
) -> Result<Framed, ServerError> {
    let bundle: CommitBundle = decode_body(&body, FrameTag::CommitBundle)?;
    current_project(&state, &headers).await?;
    let receipt = state.commits.commit(&caller.user_id, &headers.project_id, bundle).await?;
    Framed::single(FrameTag::CommitReceipt, &receipt)
}

async fn head(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Extension(headers): Extension<ProjectHeaders>,
    body: Bytes,
) -> Result<Framed, ServerError> {
    let file: HistoryFile = decode_body(&body, FrameTag::HistoryFile)?;
    ensure_same_project(&file, &headers)?;
    authorize(&state, &caller, Operation::Read, Some(&headers.project_id))?;
    let project = current_project(&state, &headers).await?;
    Framed::single(FrameTag::Head, &project.head().await)
}

async fn all_changes(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Extension(headers): Extension<ProjectHeaders>,
    body: Bytes,
) -> Result<Framed, ServerError> {
    let file: HistoryFile = decode_body(&body, FrameTag::HistoryFile)?;
    ensure_same_project(&file, &headers)?;
    authorize(&state, &caller, Operation::Read, Some(&headers.project_id))?;
    let project = current_project(&state, &headers).await?;
    let history: ChangeHistory = project.all_changes().await?;
    Framed::single(FrameTag::ChangeHistory, &history)
}

async fn latest_changes(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Result<Framed, ServerError> {
    let (file, since): (HistoryFile, DocumentRevision) =
        decode_pair(&body, FrameTag::HistoryFile, FrameTag::Revision)?;
    authorize(&state, &caller, Operation::Read, Some(&file.project_id))?;
    let project = state.store.project(&file.project_id).await?;
    let head = project.head().await;
    let history = project.changes(since, head.revision).await?;
    Framed::single(FrameTag::ChangeHistory, &history)
}

/// Body: history file, then revision. Answers with the document as it stood
/// at that revision, resolved through the archive when it predates the
/// last squash.
async fn document(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Extension(headers): Extension<ProjectHeaders>,
    body: Bytes,
) -> Result<Framed, ServerError> {
    let (file, revision): (HistoryFile, DocumentRevision) =
        decode_pair(&body, FrameTag::HistoryFile, FrameTag::Revision)?;
    ensure_same_project(&file, &headers)?;
    authorize(&state, &caller, Operation::Read, Some(&headers.project_id))?;
    let project = current_project(&state, &headers).await?;
    let document = project.materialize(revision, state.applier.as_ref()).await?;
    Framed::single(FrameTag::Snapshot, &Snapshot { revision, document })
}

async fn squash(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Extension(headers): Extension<ProjectHeaders>,
    body: Bytes,
) -> Result<Framed, ServerError> {
    let snapshot: Snapshot = decode_body(&body, FrameTag::Snapshot)?;
    authorize(&state, &caller, Operation::Squash, Some(&headers.project_id))?;
    current_project(&state, &headers).await?;
    let receipt = state.compaction.squash(&headers.project_id, snapshot).await?;
    Framed::single(FrameTag::SquashReceipt, &receipt)
}

async fn login(State(state): State<AppState>, body: Bytes) -> Result<Framed, ServerError> {
    let request: LoginRequest = decode_body(&body, FrameTag::LoginRequest)?;
    let user = state
        .policy
        .authenticate(&request.user_id, &request.password)
        .ok_or_else(|| ServerError::new(ErrorCode::Unauthorized, "invalid credentials"))?;

    let session_key = generate_session_key();
    state.sessions.put(session_key.clone(), AuthToken::new(user.id.clone(), user.name.clone())).await;
    info!(user_id = %user.id, "session opened");

    Framed::single(
        FrameTag::LoginResponse,
        &LoginResponse { session_key, user_id: user.id.clone(), user_name: user.name.clone() },
    )
}

async fn logout(State(state): State<AppState>, Extension(caller): Extension<Caller>) -> Result<Framed, ServerError> {
    state.sessions.terminate(&caller.session_key).await;
    Framed::ack()
}

async fn pause(State(state): State<AppState>, Extension(caller): Extension<Caller>) -> Result<Framed, ServerError> {
    authorize(&state, &caller, Operation::Maintenance, None)?;
    state.admission.pause(caller.user_id).await;
    Framed::ack()
}

async fn resume(State(state): State<AppState>, Extension(caller): Extension<Caller>) -> Result<Framed, ServerError> {
    authorize(&state, &caller, Operation::Maintenance, None)?;
    state.admission.resume().await;
    Framed::ack()
}
