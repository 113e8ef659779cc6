// Core domain types shared by the server and its clients.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a project or user identifier, in characters.
pub const MAX_IDENTIFIER_CHARS: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("identifier is empty")]
    Empty,

    #[error("identifier exceeds maximum length of {MAX_IDENTIFIER_CHARS} characters")]
    TooLong,

    #[error("identifier contains a path separator or control character: {0}")]
    InvalidCharacter(String),

    #[error("identifier is a reserved path component: {0}")]
    Reserved(String),
}

fn validate_identifier(value: &str) -> Result<(), IdentifierError> {
    if value.is_empty() {
        return Err(IdentifierError::Empty);
    }
    if value.chars().count() > MAX_IDENTIFIER_CHARS {
        return Err(IdentifierError::TooLong);
    }
    if value.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        return Err(IdentifierError::InvalidCharacter(value.to_string()));
    }
    if value == "." || value == ".." {
        return Err(IdentifierError::Reserved(value.to_string()));
    }
    Ok(())
}

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, IdentifierError> {
                let value = value.into();
                validate_identifier(&value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdentifierError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

identifier!(
    /// Identifies a project; doubles as the project's directory name on disk.
    ProjectId
);

identifier!(
    /// Identifies an authenticated user.
    UserId
);

/// A point in a project's append-only history.
///
/// Revision numbers never restart: a squash keeps the head of the archived
/// log as the start of the fresh one.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DocumentRevision(u64);

impl DocumentRevision {
    pub const START: Self = Self(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Result<Self, RevisionOverflow> {
        self.advance(1)
    }

    pub const fn advance(self, count: u64) -> Result<Self, RevisionOverflow> {
        match self.0.checked_add(count) {
            Some(value) => Ok(Self(value)),
            None => Err(RevisionOverflow { from: self.0, count }),
        }
    }

    /// Number of revisions between `earlier` and `self`; zero when `earlier` is later.
    pub const fn distance_from(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for DocumentRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("revision r{from} cannot advance by {count}")]
pub struct RevisionOverflow {
    pub from: u64,
    pub count: u64,
}

/// Lower-case hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    pub fn from_hex(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The category a change record belongs to. Coalesced output is emitted in
/// declaration order: identity before imports before annotations before content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Identity,
    Import,
    Annotation,
    Content,
}

impl ChangeKind {
    pub const ORDERED: [ChangeKind; 4] =
        [ChangeKind::Identity, ChangeKind::Import, ChangeKind::Annotation, ChangeKind::Content];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Add,
    Remove,
    Set,
}

/// One opaque, atomic document operation.
///
/// The history engine orders, stores and replays records but never looks
/// inside `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub op: ChangeOp,
    /// What the change targets. Ignored for identity changes, which all
    /// target the document identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ChangeRecord {
    pub fn new(kind: ChangeKind, op: ChangeOp, key: impl Into<String>) -> Self {
        Self { kind, op, key: Some(key.into()), payload: serde_json::Value::Null }
    }

    pub fn unkeyed(kind: ChangeKind, op: ChangeOp) -> Self {
        Self { kind, op, key: None, payload: serde_json::Value::Null }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Ordered records produced by a single commit.
pub type ChangeSet = Vec<ChangeRecord>;

/// Who made a revision, why, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMetadata {
    pub author: UserId,
    pub comment: String,
    pub timestamp: DateTime<Utc>,
}

impl ChangeMetadata {
    pub fn new(author: UserId, comment: impl Into<String>) -> Self {
        Self { author, comment: comment.into(), timestamp: Utc::now() }
    }
}

/// One committed change-set, keyed by the revision it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionEntry {
    pub revision: DocumentRevision,
    pub metadata: ChangeMetadata,
    pub changes: ChangeSet,
}

/// A commit request: the client's claimed baseline plus the changes to append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitBundle {
    pub baseline: Checksum,
    pub metadata: ChangeMetadata,
    pub changes: ChangeSet,
}

/// Materialized document state at a revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub revision: DocumentRevision,
    pub document: serde_json::Value,
}

impl Snapshot {
    /// Baseline every new project starts from.
    pub fn empty() -> Self {
        Self { revision: DocumentRevision::START, document: serde_json::Value::Null }
    }
}

/// Handle naming a project's history log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFile {
    pub project_id: ProjectId,
}

/// Current position of a project's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadInfo {
    pub revision: DocumentRevision,
    /// Baseline a commit must quote to be accepted.
    pub state_checksum: Checksum,
    /// Digest of the snapshot installed by the last squash.
    pub snapshot_checksum: Checksum,
}
