// Message bodies carried inside frames that are not plain domain types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::history::ChangeHistory;
use crate::types::{Checksum, DocumentRevision, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub user_id: UserId,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub session_key: String,
    pub user_id: UserId,
    pub user_name: String,
}

/// Returned by a successful commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub revision: DocumentRevision,
    pub state_checksum: Checksum,
    /// History from the pre-commit head to the new revision.
    pub history: ChangeHistory,
}

/// Returned by a successful squash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SquashReceipt {
    pub start: DocumentRevision,
    pub snapshot_checksum: Checksum,
    pub archive: String,
}

/// Body of an `Error` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub details: Value,
}
