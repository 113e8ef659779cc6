// Squash: archive the active log and snapshot, then restart the log from the
// old head with a client-supplied baseline.
//
// Order of operations, all inside the project gate except staging:
//   1. stage the new snapshot under a unique name (outside the gate)
//   2. rename it to history.log-snapshot.next, create history.log.next
//   3. write squash.intent (temp file, fsync, rename)
//   4. move history.log and history.log-snapshot into the archive segment
//   5. remove ~history.log
//   6. rename the staged files into place
//   7. remove squash.intent
// With the intent present, the archived pair decides the outcome: if both
// files reached the archive the squash rolls forward, otherwise it rolls back.
// A marker that does not parse while the live log and snapshot are both in
// place never got as far as moving anything, so it is discarded.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use chronicle_common::history::checksum::snapshot_checksum;
use chronicle_common::protocol::messages::SquashReceipt;
use chronicle_common::types::{DocumentRevision, ProjectId, Snapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::history::archive::segment_dir_name;
use crate::history::log::{RevisionLog, LOG_FILE_NAME};
use crate::history::snapshot::{write_snapshot, SNAPSHOT_FILE_NAME};
use crate::history::{HistoryError, HistoryStore, ProjectLayout};

const INTENT_FORMAT_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("snapshot is at {snapshot} but the project head is {head}")]
    SnapshotNotAtHead { snapshot: DocumentRevision, head: DocumentRevision },

    #[error("squash failed and was rolled back: {0}")]
    RolledBack(#[source] HistoryError),

    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Durable record of an in-flight squash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SquashIntent {
    pub segment_dir: PathBuf,
    pub new_start: DocumentRevision,
    pub started_at: DateTime<Utc>,
    pub format_version: u8,
}

impl SquashIntent {
    fn new(segment_dir: PathBuf, new_start: DocumentRevision) -> Self {
        Self { segment_dir, new_start, started_at: Utc::now(), format_version: INTENT_FORMAT_VERSION }
    }

    /// Make the marker durable before any file moves. It is written to
    /// `intent_staging()`, synced, then renamed, so `intent()` is either
    /// absent or complete.
    pub fn persist(&self, layout: &ProjectLayout) -> Result<(), HistoryError> {
        let json = serde_json::to_vec_pretty(self).map_err(HistoryError::Encode)?;
        let staging = layout.intent_staging();
        let mut file = File::create(&staging)
            .map_err(|source| HistoryError::io(format!("failed to create marker `{}`", staging.display()), source))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|source| HistoryError::io(format!("failed to write marker `{}`", staging.display()), source))?;
        drop(file);
        rename(&staging, &layout.intent()).inspect_err(|_| {
            let _ = fs::remove_file(&staging);
        })
    }

    pub fn read_from_file(path: &Path) -> Result<Option<Self>, HistoryError> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(HistoryError::io(format!("failed to open marker `{}`", path.display()), source))
            }
        };
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|source| HistoryError::io(format!("failed to read marker `{}`", path.display()), source))?;
        let intent: Self = serde_json::from_str(&contents)
            .map_err(|err| HistoryError::corrupt(path, format!("invalid squash marker: {err}")))?;
        if intent.format_version != INTENT_FORMAT_VERSION {
            return Err(HistoryError::corrupt(path, format!("unsupported marker version {}", intent.format_version)));
        }
        Ok(Some(intent))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// No squash was in flight.
    Clean,
    RolledForward,
    RolledBack,
}

/// Bring a project directory back to a consistent pre- or post-squash state.
///
/// Runs at startup for every project and immediately after a squash step
/// fails in-process.
pub fn recover_interrupted_squash(layout: &ProjectLayout) -> Result<Recovery, HistoryError> {
    remove_if_exists(&layout.intent_staging())?;
    let intent = match SquashIntent::read_from_file(&layout.intent()) {
        Ok(Some(intent)) => intent,
        Ok(None) => {
            // Staging may have been interrupted before the marker was written.
            remove_if_exists(&layout.staged_log())?;
            remove_if_exists(&layout.staged_snapshot())?;
            return Ok(Recovery::Clean);
        }
        Err(HistoryError::Corrupt { reason, .. }) if layout.log().exists() && layout.snapshot().exists() => {
            warn!(project_id = %layout.project_id, %reason, "discarding unreadable squash marker");
            remove_if_exists(&layout.staged_log())?;
            remove_if_exists(&layout.staged_snapshot())?;
            remove_if_exists(&layout.intent())?;
            return Ok(Recovery::RolledBack);
        }
        Err(err) => return Err(err),
    };

    let archived_log = intent.segment_dir.join(LOG_FILE_NAME);
    let archived_snapshot = intent.segment_dir.join(SNAPSHOT_FILE_NAME);

    let outcome = if archived_log.exists() && archived_snapshot.exists() {
        remove_if_exists(&layout.backup())?;
        finish_rename(&layout.staged_log(), &layout.log())?;
        finish_rename(&layout.staged_snapshot(), &layout.snapshot())?;
        warn!(
            project_id = %layout.project_id,
            segment = %intent.segment_dir.display(),
            new_start = %intent.new_start,
            "rolled interrupted squash forward"
        );
        Recovery::RolledForward
    } else {
        if archived_log.exists() && !layout.log().exists() {
            rename(&archived_log, &layout.log())?;
        }
        if archived_snapshot.exists() && !layout.snapshot().exists() {
            rename(&archived_snapshot, &layout.snapshot())?;
        }
        remove_if_exists(&layout.staged_log())?;
        remove_if_exists(&layout.staged_snapshot())?;
        let _ = fs::remove_dir(&intent.segment_dir);
        warn!(
            project_id = %layout.project_id,
            segment = %intent.segment_dir.display(),
            "rolled interrupted squash back"
        );
        Recovery::RolledBack
    };

    remove_if_exists(&layout.intent())?;
    Ok(outcome)
}

/// Points in the file swap after which a squash can be interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapStep {
    Staged,
    IntentWritten,
    LogArchived,
    SnapshotArchived,
    LogInstalled,
}

/// Runs squashes against a [`HistoryStore`].
#[derive(Debug, Clone)]
pub struct CompactionManager {
    store: Arc<HistoryStore>,
    #[cfg(test)]
    fail_after: Option<SwapStep>,
}

impl CompactionManager {
    pub fn new(store: Arc<HistoryStore>) -> Self {
        Self {
            store,
            #[cfg(test)]
            fail_after: None,
        }
    }

    #[cfg(test)]
    fn failing_after(mut self, step: SwapStep) -> Self {
        self.fail_after = Some(step);
        self
    }

    fn checkpoint(&self, step: SwapStep) -> Result<(), HistoryError> {
        debug!(?step, "squash step complete");
        #[cfg(test)]
        if self.fail_after == Some(step) {
            return Err(HistoryError::io(
                format!("squash interrupted after {step:?}"),
                std::io::Error::other("injected failure"),
            ));
        }
        Ok(())
    }

    /// Archive the project's history and restart it from `snapshot`, which
    /// must be the materialized document at the current head.
    pub async fn squash(
        &self,
        project_id: &ProjectId,
        snapshot: Snapshot,
    ) -> Result<SquashReceipt, CompactionError> {
        async move {
            let project = self.store.project(project_id).await?;
            let layout = project.layout().clone();

            let staged = stage_snapshot(&layout, &snapshot)?;
            let guard = project.lock().await;

            let head = guard.head().await.revision;
            if snapshot.revision != head {
                let _ = fs::remove_file(&staged);
                return Err(CompactionError::SnapshotNotAtHead { snapshot: snapshot.revision, head });
            }

            let segment_dir = match create_segment_dir(&layout.archive_dir) {
                Ok(dir) => dir,
                Err(err) => {
                    let _ = fs::remove_file(&staged);
                    return Err(err.into());
                }
            };

            match swap_files(&layout, &staged, &segment_dir, head, &|step| self.checkpoint(step)) {
                Ok(()) => {
                    guard.reload().await?;
                }
                Err(err) => {
                    let _ = fs::remove_file(&staged);
                    // Reload whatever recovery left on disk, even if it failed.
                    let recovery = recover_interrupted_squash(&layout);
                    let reloaded = guard.reload().await;
                    let recovery = recovery?;
                    reloaded?;
                    if recovery != Recovery::RolledForward {
                        let _ = fs::remove_dir(&segment_dir);
                        return Err(CompactionError::RolledBack(err));
                    }
                    warn!(error = %err, "squash step failed after archiving; rolled forward");
                }
            }
            drop(guard);

            let receipt = SquashReceipt {
                start: head,
                snapshot_checksum: snapshot_checksum(&snapshot),
                archive: segment_dir.display().to_string(),
            };
            info!(start = %receipt.start, archive = %receipt.archive, "squashed project history");
            Ok(receipt)
        }
        .instrument(info_span!("chronicle.compaction.squash", project_id = %project_id))
        .await
    }
}

fn stage_snapshot(layout: &ProjectLayout, snapshot: &Snapshot) -> Result<PathBuf, HistoryError> {
    let nonce = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or_default();
    let staged = layout.dir.join(format!("{SNAPSHOT_FILE_NAME}.stage.{nonce}"));
    write_snapshot(&staged, snapshot)?;
    Ok(staged)
}

fn create_segment_dir(project_archive_dir: &Path) -> Result<PathBuf, HistoryError> {
    fs::create_dir_all(project_archive_dir).map_err(|source| {
        HistoryError::io(format!("failed to create archive `{}`", project_archive_dir.display()), source)
    })?;

    let base = segment_dir_name(Utc::now());
    for attempt in 0..100u32 {
        let name = if attempt == 0 { base.clone() } else { format!("{base}-{attempt}") };
        let dir = project_archive_dir.join(name);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(source) => {
                return Err(HistoryError::io(format!("failed to create segment `{}`", dir.display()), source))
            }
        }
    }
    Err(HistoryError::io(
        format!("no free segment name under `{}`", project_archive_dir.display()),
        std::io::Error::from(std::io::ErrorKind::AlreadyExists),
    ))
}

fn swap_files(
    layout: &ProjectLayout,
    staged_snapshot: &Path,
    segment_dir: &Path,
    new_start: DocumentRevision,
    checkpoint: &dyn Fn(SwapStep) -> Result<(), HistoryError>,
) -> Result<(), HistoryError> {
    remove_if_exists(&layout.staged_log())?;
    rename(staged_snapshot, &layout.staged_snapshot())?;
    RevisionLog::create(layout.staged_log(), new_start)?;
    checkpoint(SwapStep::Staged)?;

    SquashIntent::new(segment_dir.to_path_buf(), new_start).persist(layout)?;
    checkpoint(SwapStep::IntentWritten)?;

    rename(&layout.log(), &segment_dir.join(LOG_FILE_NAME))?;
    checkpoint(SwapStep::LogArchived)?;
    rename(&layout.snapshot(), &segment_dir.join(SNAPSHOT_FILE_NAME))?;
    checkpoint(SwapStep::SnapshotArchived)?;
    remove_if_exists(&layout.backup())?;
    rename(&layout.staged_log(), &layout.log())?;
    checkpoint(SwapStep::LogInstalled)?;
    rename(&layout.staged_snapshot(), &layout.snapshot())?;

    remove_if_exists(&layout.intent())
}

/// Rename `staged` over `target` unless a previous run already did.
fn finish_rename(staged: &Path, target: &Path) -> Result<(), HistoryError> {
    if staged.exists() {
        rename(staged, target)
    } else if target.exists() {
        Ok(())
    } else {
        Err(HistoryError::corrupt(staged, "staged file and its target are both missing"))
    }
}

fn rename(from: &Path, to: &Path) -> Result<(), HistoryError> {
    fs::rename(from, to).map_err(|source| {
        HistoryError::io(format!("failed to move `{}` to `{}`", from.display(), to.display()), source)
    })
}

fn remove_if_exists(path: &Path) -> Result<(), HistoryError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(HistoryError::io(format!("failed to remove `{}`", path.display()), source)),
    }
}
