// On-disk project history: revision log, snapshot baseline and archive.
//
// <data_root>/<project>/
//   history.log            active revision log
//   history.log-snapshot   baseline the active log starts from
//   history.log.next       staged log during a squash
//   history.log-snapshot.next
//   squash.intent          squash marker, present only while one is in flight
//   squash.intent.next     marker being written; renamed over squash.intent once synced
//   ~history.log           stale backup left by older tooling; removed on squash
// <archive_root>/<project>/squash-<timestamp>/{history.log, history.log-snapshot}

pub mod apply;
pub mod archive;
pub mod log;
pub mod snapshot;
pub mod store;

use std::path::{Path, PathBuf};

use chronicle_common::history::ChangeHistoryError;
use chronicle_common::types::{ChangeRecord, DocumentRevision, ProjectId, RevisionOverflow};
use serde_json::Value;
use thiserror::Error;

pub use apply::KeyedApplier;
pub use archive::ArchiveIndex;
pub use log::RevisionLog;
pub use store::{HistoryStore, ProjectGuard, ProjectHistory};

pub const INTENT_FILE_NAME: &str = "squash.intent";
pub const BACKUP_FILE_NAME: &str = "~history.log";
const STAGED_SUFFIX: &str = ".next";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("{0}")]
    NotFound(String),

    #[error("revision {start} is outside the log ({log_start}, {head}]")]
    OutOfRange { start: DocumentRevision, log_start: DocumentRevision, head: DocumentRevision },

    #[error("project `{0}` already exists")]
    AlreadyExists(ProjectId),

    #[error("history file `{path}` is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode history entry: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("history entry of {0} bytes exceeds the maximum")]
    TooLarge(usize),

    #[error("log `{0}` is archived and read-only")]
    ReadOnly(String),

    #[error("log `{0}` holds an unrecoverable partial write; reopen it to rebuild the index")]
    Poisoned(String),

    #[error("data root `{}` and archive root `{}` are on different filesystems", data_root.display(), archive_root.display())]
    CrossDevice { data_root: PathBuf, archive_root: PathBuf },

    #[error(transparent)]
    Overflow(#[from] RevisionOverflow),

    #[error(transparent)]
    Sequence(#[from] ChangeHistoryError),

    #[error(transparent)]
    Apply(#[from] ApplyError),
}

impl HistoryError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }

    pub(crate) fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::Corrupt { path: path.to_path_buf(), reason: reason.into() }
    }

    /// Whether the caller asked for something that does not exist, as
    /// opposed to a storage failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::OutOfRange { .. } | Self::Sequence(_))
    }
}

#[derive(Debug, Error)]
#[error("document apply failed: {0}")]
pub struct ApplyError(pub String);

/// The external engine that interprets change records.
///
/// The history layer never looks inside a record; it only hands the
/// coalesced sequence to an applier when asked to materialize a document.
pub trait DocumentApplier: Send + Sync {
    fn apply(&self, base: &Value, changes: &[ChangeRecord]) -> Result<Value, ApplyError>;
}

/// File locations for one project.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    pub project_id: ProjectId,
    pub dir: PathBuf,
    pub archive_dir: PathBuf,
}

impl ProjectLayout {
    pub fn new(data_root: &Path, archive_root: &Path, project_id: &ProjectId) -> Self {
        Self {
            project_id: project_id.clone(),
            dir: data_root.join(project_id.as_str()),
            archive_dir: archive_root.join(project_id.as_str()),
        }
    }

    pub fn log(&self) -> PathBuf {
        self.dir.join(log::LOG_FILE_NAME)
    }

    pub fn snapshot(&self) -> PathBuf {
        self.dir.join(snapshot::SNAPSHOT_FILE_NAME)
    }

    pub fn staged_log(&self) -> PathBuf {
        self.dir.join(format!("{}{STAGED_SUFFIX}", log::LOG_FILE_NAME))
    }

    pub fn staged_snapshot(&self) -> PathBuf {
        self.dir.join(format!("{}{STAGED_SUFFIX}", snapshot::SNAPSHOT_FILE_NAME))
    }

    pub fn backup(&self) -> PathBuf {
        self.dir.join(BACKUP_FILE_NAME)
    }

    pub fn intent(&self) -> PathBuf {
        self.dir.join(INTENT_FILE_NAME)
    }

    /// Where the marker is written before it is renamed over `intent()`.
    pub fn intent_staging(&self) -> PathBuf {
        self.dir.join(format!("{INTENT_FILE_NAME}{STAGED_SUFFIX}"))
    }
}
