#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header::AUTHORIZATION, Method, Request, StatusCode},
    response::Response,
    Router,
};
use chronicle_common::protocol::frame::{decode_single, encode_frame, FrameTag};
use chronicle_common::protocol::messages::{ErrorBody, LoginRequest, LoginResponse};
use chronicle_common::protocol::{Endpoint, LOGIN_PATH, PROJECT_ID_HEADER, SNAPSHOT_CHECKSUM_HEADER};
use chronicle_common::types::{
    ChangeKind, ChangeMetadata, ChangeOp, ChangeRecord, Checksum, CommitBundle, HeadInfo, HistoryFile, ProjectId,
    UserId,
};
use chronicle_server::access::{hash_password, StaticAccessPolicy};
use chronicle_server::admission::AdmissionController;
use chronicle_server::api::{build_router, AppState};
use chronicle_server::config::AccessConfig;
use chronicle_server::history::{HistoryStore, KeyedApplier};
use chronicle_server::session::SessionCache;
use serde::{de::DeserializeOwned, Serialize};
use tempfile::TempDir;
use tower::ServiceExt;

pub const PASSWORD: &str = "correct horse battery staple";

pub struct TestServer {
    pub app: Router,
    pub store: Arc<HistoryStore>,
    _tmp: TempDir,
}

pub fn project() -> ProjectId {
    ProjectId::new("pizza").expect("valid project")
}

pub fn user(id: &str) -> UserId {
    UserId::new(id).expect("valid user")
}

fn access_config() -> AccessConfig {
    let hash = hash_password(PASSWORD).expect("hash password");
    AccessConfig::parse(&format!(
        r#"
[[users]]
id = "alice"
name = "Alice"
password_hash = "{hash}"
maintenance = true

[[users]]
id = "bob"
name = "Bob"
password_hash = "{hash}"

[[users]]
id = "carol"
name = "Carol"
password_hash = "{hash}"

[[projects]]
id = "pizza"
workflow_managers = ["alice"]

[[projects.members]]
user = "alice"
operations = ["read", "commit", "squash"]

[[projects.members]]
user = "bob"
operations = ["read", "commit"]

[[projects.members]]
user = "carol"
operations = ["read"]
"#
    ))
    .expect("access config parses")
}

impl TestServer {
    pub async fn start() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(
            HistoryStore::open(tmp.path().join("data"), tmp.path().join("archive")).expect("store opens"),
        );
        let config = access_config();
        for project in &config.projects {
            store.ensure_project(&project.id).await.expect("project created");
        }
        let app = build_router(AppState::new(
            Arc::clone(&store),
            Arc::new(StaticAccessPolicy::from_config(&config)),
            SessionCache::default(),
            AdmissionController::from_config(&config),
            Arc::new(KeyedApplier),
        ));
        Self { app, store, _tmp: tmp }
    }

    pub async fn send(
        &self,
        path: &str,
        session_key: Option<&str>,
        snapshot_checksum: Option<&Checksum>,
        body: Vec<u8>,
    ) -> Response {
        self.app
            .clone()
            .oneshot(request(path, session_key, snapshot_checksum, body))
            .await
            .expect("request should return a response")
    }

    pub async fn login(&self, user_id: &str) -> String {
        let body = frame(FrameTag::LoginRequest, &LoginRequest { user_id: user(user_id), password: PASSWORD.into() });
        let response = self.send(LOGIN_PATH, None, None, body).await;
        assert_eq!(response.status(), StatusCode::OK);
        let login: LoginResponse = read_frame(response, FrameTag::LoginResponse).await;
        assert_eq!(login.user_id, user(user_id));
        login.session_key
    }

    pub async fn head(&self, key: &str, snapshot_checksum: &Checksum) -> Response {
        let body = frame(FrameTag::HistoryFile, &HistoryFile { project_id: project() });
        self.send(Endpoint::Head.path(), Some(key), Some(snapshot_checksum), body).await
    }

    /// Current head as seen through the store, bypassing the HTTP surface.
    pub async fn current_head(&self) -> HeadInfo {
        self.store.head(&project()).await.expect("head")
    }

    pub async fn commit(&self, key: &str, snapshot_checksum: &Checksum, baseline: &Checksum, item: &str) -> Response {
        self.app
            .clone()
            .oneshot(commit_request(key, snapshot_checksum, baseline, item))
            .await
            .expect("request should return a response")
    }
}

pub fn request(path: &str, session_key: Option<&str>, snapshot_checksum: Option<&Checksum>, body: Vec<u8>) -> Request<Body> {
    let mut request = Request::builder().method(Method::POST).uri(path);
    if let Some(key) = session_key {
        request = request.header(AUTHORIZATION, format!("Bearer {key}"));
    }
    if let Some(checksum) = snapshot_checksum {
        request = request
            .header(PROJECT_ID_HEADER, project().as_str())
            .header(SNAPSHOT_CHECKSUM_HEADER, checksum.as_str());
    }
    request.body(Body::from(body)).expect("request should build")
}

pub fn commit_request(key: &str, snapshot_checksum: &Checksum, baseline: &Checksum, item: &str) -> Request<Body> {
    let bundle = CommitBundle {
        baseline: baseline.clone(),
        metadata: ChangeMetadata::new(user("spoofed"), format!("add {item}")),
        changes: vec![ChangeRecord::new(ChangeKind::Content, ChangeOp::Add, item)
            .with_payload(serde_json::json!({ "item": item }))],
    };
    request(Endpoint::Commit.path(), Some(key), Some(snapshot_checksum), frame(FrameTag::CommitBundle, &bundle))
}

pub fn frame<T: Serialize>(tag: FrameTag, message: &T) -> Vec<u8> {
    encode_frame(tag, message).expect("frame encodes")
}

pub async fn read_frame<T: DeserializeOwned>(response: Response, tag: FrameTag) -> T {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should be readable");
    decode_single(&body, tag).expect("body should hold the expected frame")
}

pub async fn read_error(response: Response) -> ErrorBody {
    read_frame(response, FrameTag::Error).await
}
