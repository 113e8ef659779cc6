mod support;

use axum::http::StatusCode;
use chronicle_common::history::checksum::state_checksum;
use chronicle_common::history::ChangeHistory;
use chronicle_common::protocol::frame::FrameTag;
use chronicle_common::protocol::messages::{CommitReceipt, SquashReceipt};
use chronicle_common::protocol::Endpoint;
use chronicle_common::types::{Checksum, DocumentRevision, HeadInfo, HistoryFile, Snapshot};
use serde_json::json;
use support::{commit_request, frame, project, read_error, read_frame, user, TestServer};
use tower::ServiceExt;

fn latest_body(since: u64) -> Vec<u8> {
    let mut body = frame(FrameTag::HistoryFile, &HistoryFile { project_id: project() });
    body.extend(frame(FrameTag::Revision, &DocumentRevision::new(since)));
    body
}

#[tokio::test]
async fn commit_then_stale_commit_then_resync() {
    let server = TestServer::start().await;
    let alice = server.login("alice").await;
    let bob = server.login("bob").await;

    let current = server.current_head().await;
    let head: HeadInfo = read_frame(server.head(&alice, &current.snapshot_checksum).await, FrameTag::Head).await;
    assert_eq!(head.revision, DocumentRevision::START);
    let snapshot = head.snapshot_checksum.clone();

    // Alice commits on the initial baseline.
    let response = server.commit(&alice, &snapshot, &head.state_checksum, "pepperoni").await;
    assert_eq!(response.status(), StatusCode::OK);
    let receipt: CommitReceipt = read_frame(response, FrameTag::CommitReceipt).await;
    assert_eq!(receipt.revision, DocumentRevision::new(1));
    assert_eq!(receipt.history.entries()[0].metadata.author, user("alice"));

    // Bob still holds the old baseline.
    let response = server.commit(&bob, &snapshot, &head.state_checksum, "pineapple").await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let error = read_error(response).await;
    assert_eq!(error.code, "CONFLICT");
    assert!(!error.retryable);
    assert_eq!(error.details["submitted"], json!(head.state_checksum));
    assert_eq!(error.details["current"], json!(receipt.state_checksum));

    // Bob resyncs from the full history and recomputes the baseline himself.
    let body = frame(FrameTag::HistoryFile, &HistoryFile { project_id: project() });
    let response = server.send(Endpoint::AllChanges.path(), Some(&bob), Some(&snapshot), body).await;
    assert_eq!(response.status(), StatusCode::OK);
    let history: ChangeHistory = read_frame(response, FrameTag::ChangeHistory).await;
    let baseline = state_checksum(&snapshot, &history);
    assert_eq!(baseline, receipt.state_checksum);

    let response = server.commit(&bob, &snapshot, &baseline, "pineapple").await;
    assert_eq!(response.status(), StatusCode::OK);
    let receipt: CommitReceipt = read_frame(response, FrameTag::CommitReceipt).await;
    assert_eq!(receipt.revision, DocumentRevision::new(2));
    assert_eq!(receipt.history.start(), DocumentRevision::new(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_http_commits_admit_exactly_one() {
    let server = TestServer::start().await;
    let alice = server.login("alice").await;
    let head = server.current_head().await;

    let tasks: Vec<_> = (0..6)
        .map(|i| {
            let app = server.app.clone();
            let request = commit_request(&alice, &head.snapshot_checksum, &head.state_checksum, &format!("topping-{i}"));
            tokio::spawn(async move { app.oneshot(request).await.expect("request should return a response").status() })
        })
        .collect();

    let mut statuses = Vec::new();
    for task in tasks {
        statuses.push(task.await.expect("commit task"));
    }

    assert_eq!(statuses.iter().filter(|s| **s == StatusCode::OK).count(), 1);
    assert_eq!(statuses.iter().filter(|s| **s == StatusCode::CONFLICT).count(), 5);
    assert_eq!(server.current_head().await.revision, DocumentRevision::new(1));
}

#[tokio::test]
async fn missing_project_headers_are_bad_requests() {
    let server = TestServer::start().await;
    let alice = server.login("alice").await;

    let body = frame(FrameTag::HistoryFile, &HistoryFile { project_id: project() });
    let response = server.send(Endpoint::Head.path(), Some(&alice), None, body).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_error(response).await.code, "BAD_REQUEST");

    // Missing headers win over a missing session.
    let body = frame(FrameTag::HistoryFile, &HistoryFile { project_id: project() });
    let response = server.send(Endpoint::Head.path(), None, None, body).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn snapshot_mismatch_is_distinct_from_conflict() {
    let server = TestServer::start().await;
    let alice = server.login("alice").await;

    let response = server.head(&alice, &Checksum::from_hex("deadbeef")).await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    let error = read_error(response).await;
    assert_eq!(error.code, "SNAPSHOT_OUT_OF_DATE");
    assert_eq!(error.details["submitted"], "deadbeef");
}

#[tokio::test]
async fn requests_without_a_session_are_unauthorized() {
    let server = TestServer::start().await;
    let head = server.current_head().await;

    let response = server.head("not-a-session", &head.snapshot_checksum).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(read_error(response).await.code, "UNAUTHORIZED");
}

#[tokio::test]
async fn read_only_member_cannot_commit() {
    let server = TestServer::start().await;
    let carol = server.login("carol").await;
    let head = server.current_head().await;

    let response = server.commit(&carol, &head.snapshot_checksum, &head.state_checksum, "anchovy").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(server.current_head().await.revision, DocumentRevision::START);

    // Reads are still allowed.
    let response = server.head(&carol, &head.snapshot_checksum).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn latest_changes_reads_frames_in_order() {
    let server = TestServer::start().await;
    let alice = server.login("alice").await;
    let head = server.current_head().await;
    let receipt: CommitReceipt =
        read_frame(server.commit(&alice, &head.snapshot_checksum, &head.state_checksum, "basil").await, FrameTag::CommitReceipt)
            .await;
    server.commit(&alice, &head.snapshot_checksum, &receipt.state_checksum, "olive").await;

    let response = server.send(Endpoint::LatestChanges.path(), Some(&alice), None, latest_body(1)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let history: ChangeHistory = read_frame(response, FrameTag::ChangeHistory).await;
    assert_eq!(history.start(), DocumentRevision::new(1));
    assert_eq!(history.head(), DocumentRevision::new(2));

    // Revision before file handle is rejected.
    let mut reversed = frame(FrameTag::Revision, &DocumentRevision::new(1));
    reversed.extend(frame(FrameTag::HistoryFile, &HistoryFile { project_id: project() }));
    let response = server.send(Endpoint::LatestChanges.path(), Some(&alice), None, reversed).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Asking past the head is not found.
    let response = server.send(Endpoint::LatestChanges.path(), Some(&alice), None, latest_body(9)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn squash_keeps_history_reachable_and_rotates_snapshot() {
    let server = TestServer::start().await;
    let alice = server.login("alice").await;
    let head = server.current_head().await;
    let first: CommitReceipt =
        read_frame(server.commit(&alice, &head.snapshot_checksum, &head.state_checksum, "basil").await, FrameTag::CommitReceipt)
            .await;
    let second: CommitReceipt = read_frame(
        server.commit(&alice, &head.snapshot_checksum, &first.state_checksum, "olive").await,
        FrameTag::CommitReceipt,
    )
    .await;

    let snapshot = Snapshot { revision: second.revision, document: json!({ "basil": true, "olive": true }) };
    let response = server
        .send(Endpoint::Squash.path(), Some(&alice), Some(&head.snapshot_checksum), frame(FrameTag::Snapshot, &snapshot))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let receipt: SquashReceipt = read_frame(response, FrameTag::SquashReceipt).await;
    assert_eq!(receipt.start, DocumentRevision::new(2));
    assert_ne!(receipt.snapshot_checksum, head.snapshot_checksum);

    // The old snapshot checksum is now out of date.
    let response = server.head(&alice, &head.snapshot_checksum).await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);

    let new_head: HeadInfo = read_frame(server.head(&alice, &receipt.snapshot_checksum).await, FrameTag::Head).await;
    assert_eq!(new_head.revision, DocumentRevision::new(2));
    assert_eq!(new_head.state_checksum, receipt.snapshot_checksum);

    // Pre-squash revisions are still served from the archive.
    let response = server.send(Endpoint::LatestChanges.path(), Some(&alice), None, latest_body(0)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let history: ChangeHistory = read_frame(response, FrameTag::ChangeHistory).await;
    assert_eq!(history.len(), 2);

    // Commits continue from the new baseline.
    let response = server.commit(&alice, &receipt.snapshot_checksum, &new_head.state_checksum, "garlic").await;
    assert_eq!(response.status(), StatusCode::OK);
    let receipt: CommitReceipt = read_frame(response, FrameTag::CommitReceipt).await;
    assert_eq!(receipt.revision, DocumentRevision::new(3));
}

#[tokio::test]
async fn squash_requires_grant_and_current_head() {
    let server = TestServer::start().await;
    let alice = server.login("alice").await;
    let bob = server.login("bob").await;
    let head = server.current_head().await;
    server.commit(&alice, &head.snapshot_checksum, &head.state_checksum, "basil").await;

    let stale = Snapshot { revision: DocumentRevision::START, document: json!({}) };
    let response = server
        .send(Endpoint::Squash.path(), Some(&bob), Some(&head.snapshot_checksum), frame(FrameTag::Snapshot, &stale))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = server
        .send(Endpoint::Squash.path(), Some(&alice), Some(&head.snapshot_checksum), frame(FrameTag::Snapshot, &stale))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(server.current_head().await.snapshot_checksum, head.snapshot_checksum);
}

async fn document_at(server: &TestServer, key: &str, snapshot_checksum: &Checksum, revision: u64) -> Snapshot {
    let response = server.send(Endpoint::Document.path(), Some(key), Some(snapshot_checksum), latest_body(revision)).await;
    assert_eq!(response.status(), StatusCode::OK, "document at r{revision}");
    read_frame(response, FrameTag::Snapshot).await
}

#[tokio::test]
async fn documents_materialize_identically_across_a_squash() {
    let server = TestServer::start().await;
    let alice = server.login("alice").await;
    let carol = server.login("carol").await;
    let head = server.current_head().await;
    let first: CommitReceipt =
        read_frame(server.commit(&alice, &head.snapshot_checksum, &head.state_checksum, "basil").await, FrameTag::CommitReceipt)
            .await;
    server.commit(&alice, &head.snapshot_checksum, &first.state_checksum, "olive").await;

    let mut before = Vec::new();
    for revision in 0..=2 {
        before.push(document_at(&server, &carol, &head.snapshot_checksum, revision).await);
    }
    assert_eq!(before[0].document, json!({}));
    assert_eq!(before[1].document, json!({ "Content:basil": { "item": "basil" } }));

    // The squash baseline is the document the server itself materialized at head.
    let response = server
        .send(Endpoint::Squash.path(), Some(&alice), Some(&head.snapshot_checksum), frame(FrameTag::Snapshot, &before[2]))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let receipt: SquashReceipt = read_frame(response, FrameTag::SquashReceipt).await;

    let squashed_head: HeadInfo = read_frame(server.head(&alice, &receipt.snapshot_checksum).await, FrameTag::Head).await;
    let response = server.commit(&alice, &receipt.snapshot_checksum, &squashed_head.state_checksum, "garlic").await;
    assert_eq!(response.status(), StatusCode::OK);

    for (revision, expected) in before.iter().enumerate() {
        let after = document_at(&server, &carol, &receipt.snapshot_checksum, revision as u64).await;
        assert_eq!(&after, expected, "r{revision} after squash");
    }
    let latest = document_at(&server, &carol, &receipt.snapshot_checksum, 3).await;
    assert_eq!(latest.document["Content:garlic"], json!({ "item": "garlic" }));
    assert_eq!(latest.document["Content:olive"], before[2].document["Content:olive"]);

    // A stale snapshot checksum and a revision past the head are both refused.
    let response = server.send(Endpoint::Document.path(), Some(&carol), Some(&head.snapshot_checksum), latest_body(1)).await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    let response =
        server.send(Endpoint::Document.path(), Some(&carol), Some(&receipt.snapshot_checksum), latest_body(4)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
