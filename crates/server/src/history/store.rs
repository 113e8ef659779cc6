use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chronicle_common::history::checksum::{advance_state_checksum, snapshot_checksum, state_checksum};
use chronicle_common::history::ChangeHistory;
use chronicle_common::types::{
    ChangeMetadata, ChangeSet, Checksum, DocumentRevision, HeadInfo, ProjectId, RevisionEntry, Snapshot,
};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use tracing::{error, info, warn};

use super::archive::ArchiveIndex;
use super::log::RevisionLog;
use super::snapshot::{read_snapshot, write_snapshot};
use super::{DocumentApplier, HistoryError, ProjectLayout};
use crate::compaction::recover_interrupted_squash;

/// Live state of one project, replaced wholesale by a squash.
#[derive(Debug)]
pub(crate) struct ProjectState {
    pub(crate) log: RevisionLog,
    pub(crate) archive: ArchiveIndex,
    pub(crate) snapshot: Snapshot,
    pub(crate) snapshot_checksum: Checksum,
    pub(crate) state_checksum: Checksum,
}

impl ProjectState {
    /// Load the active log, its snapshot and the archive chain from disk.
    pub(crate) fn load(layout: &ProjectLayout) -> Result<Self, HistoryError> {
        let log = RevisionLog::open(layout.log())?;
        let snapshot = read_snapshot(&layout.snapshot())?;
        if snapshot.revision != log.start() {
            return Err(HistoryError::corrupt(
                &layout.snapshot(),
                format!("snapshot is at {} but the log starts at {}", snapshot.revision, log.start()),
            ));
        }

        let snapshot_checksum = snapshot_checksum(&snapshot);
        let state_checksum = state_checksum(&snapshot_checksum, &log.read_all()?);
        let archive = ArchiveIndex::load(&layout.archive_dir, log.start())?;
        Ok(Self { log, archive, snapshot, snapshot_checksum, state_checksum })
    }

    /// Replace a poisoned log with a fresh open of the file, which truncates
    /// the torn frame. The state checksum is rebuilt from what survived.
    fn reopen_log(&mut self, path: &Path) {
        let reopened = RevisionLog::open(path).and_then(|log| {
            let history = log.read_all()?;
            Ok((log, history))
        });
        match reopened {
            Ok((log, history)) => {
                warn!(path = %path.display(), head = %log.head(), "reopened history log after failed rollback");
                self.state_checksum = state_checksum(&self.snapshot_checksum, &history);
                self.log = log;
            }
            Err(err) => {
                error!(path = %path.display(), error = %err, "history log stays unavailable until restart");
            }
        }
    }

    fn head_info(&self) -> HeadInfo {
        HeadInfo {
            revision: self.log.head(),
            state_checksum: self.state_checksum.clone(),
            snapshot_checksum: self.snapshot_checksum.clone(),
        }
    }

    /// Archive-aware range read.
    fn changes(
        &self,
        start_exclusive: DocumentRevision,
        end_inclusive: DocumentRevision,
    ) -> Result<ChangeHistory, HistoryError> {
        let active_start = self.log.start();
        if start_exclusive >= active_start {
            return self.log.range(start_exclusive, end_inclusive);
        }

        let archived = self.archive.range(start_exclusive, end_inclusive.min(active_start))?;
        if archived.head() != active_start || end_inclusive <= active_start {
            return Ok(archived);
        }
        let active = self.log.range(active_start, end_inclusive)?;
        Ok(archived.concat(active)?)
    }

    fn baseline_for(&self, revision: DocumentRevision) -> Result<(Snapshot, ChangeHistory), HistoryError> {
        if revision >= self.log.start() {
            let history = self.log.range(self.log.start(), revision)?;
            if history.head() != revision {
                return Err(HistoryError::NotFound(format!("revision {revision} is past the head")));
            }
            return Ok((self.snapshot.clone(), history));
        }

        let segment = self
            .archive
            .segment_containing(revision)
            .ok_or_else(|| HistoryError::NotFound(format!("revision {revision} is not in the archive")))?;
        let snapshot = segment.snapshot()?;
        let history = segment.log().range(segment.start(), revision)?;
        Ok((snapshot, history))
    }
}

/// One project's history plus the gate that serializes its commits and squashes.
#[derive(Debug)]
pub struct ProjectHistory {
    layout: ProjectLayout,
    gate: Mutex<()>,
    state: Arc<RwLock<ProjectState>>,
}

impl ProjectHistory {
    fn new(layout: ProjectLayout, state: ProjectState) -> Self {
        Self { layout, gate: Mutex::new(()), state: Arc::new(RwLock::new(state)) }
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.layout.project_id
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    /// Take the per-project gate. Commits and squashes both hold it for
    /// their whole critical section; reads never take it.
    pub async fn lock(&self) -> ProjectGuard<'_> {
        let guard = self.gate.lock().await;
        ProjectGuard { project: self, _gate: guard }
    }

    pub async fn head(&self) -> HeadInfo {
        self.state.read().await.head_info()
    }

    pub async fn snapshot_checksum(&self) -> Checksum {
        self.state.read().await.snapshot_checksum.clone()
    }

    /// Entries in `(start_exclusive, end_inclusive]`, reaching into the
    /// archive when `start_exclusive` predates the active log.
    pub async fn changes(
        &self,
        start_exclusive: DocumentRevision,
        end_inclusive: DocumentRevision,
    ) -> Result<ChangeHistory, HistoryError> {
        self.state.read().await.changes(start_exclusive, end_inclusive)
    }

    /// Everything the active log holds, from its start to its head.
    pub async fn all_changes(&self) -> Result<ChangeHistory, HistoryError> {
        self.state.read().await.log.read_all()
    }

    /// Document state at `revision`: the nearest baseline snapshot at or
    /// before it, plus the coalesced changes committed since.
    pub async fn materialize(
        &self,
        revision: DocumentRevision,
        applier: &dyn DocumentApplier,
    ) -> Result<Value, HistoryError> {
        let (snapshot, history) = self.state.read().await.baseline_for(revision)?;
        Ok(applier.apply(&snapshot.document, &history.normalized_changes())?)
    }

    pub(crate) async fn read_state(&self) -> RwLockReadGuard<'_, ProjectState> {
        self.state.read().await
    }
}

/// Exclusive access to a project's write path.
pub struct ProjectGuard<'a> {
    project: &'a ProjectHistory,
    _gate: MutexGuard<'a, ()>,
}

impl<'a> ProjectGuard<'a> {
    pub fn project(&self) -> &'a ProjectHistory {
        self.project
    }

    pub async fn head(&self) -> HeadInfo {
        self.project.head().await
    }

    /// Durably append and advance the state checksum.
    ///
    /// The write and fsync run on the blocking pool while the state lock is
    /// held, so readers wait for the append but runtime workers do not.
    pub async fn append(
        &self,
        changes: &ChangeSet,
        metadata: &ChangeMetadata,
    ) -> Result<(RevisionEntry, Checksum), HistoryError> {
        let mut state = Arc::clone(&self.project.state).write_owned().await;
        let log_path = self.project.layout.log();
        let (records, meta) = (changes.clone(), metadata.clone());
        let (mut state, appended) = tokio::task::spawn_blocking(move || {
            let appended = state.log.append(&records, &meta);
            if appended.is_err() && state.log.is_poisoned() {
                state.reopen_log(&log_path);
            }
            (state, appended)
        })
        .await
        .map_err(|err| HistoryError::io("history append task failed", std::io::Error::other(err.to_string())))?;

        let revision = appended?;
        let entry = RevisionEntry { revision, metadata: metadata.clone(), changes: changes.clone() };
        state.state_checksum = advance_state_checksum(&state.state_checksum, &entry);
        Ok((entry, state.state_checksum.clone()))
    }

    /// Reload the project from disk after a squash finished or was rolled
    /// back. The archive index is rescanned, picking up any new segment.
    pub(crate) async fn reload(&self) -> Result<(), HistoryError> {
        let fresh = ProjectState::load(&self.project.layout)?;
        *self.project.state.write().await = fresh;
        Ok(())
    }
}

/// Every project under the data root, opened once and shared.
#[derive(Debug)]
pub struct HistoryStore {
    data_root: PathBuf,
    archive_root: PathBuf,
    projects: RwLock<HashMap<ProjectId, Arc<ProjectHistory>>>,
}

impl HistoryStore {
    /// Open every project directory under `data_root`, finishing or undoing
    /// any squash that was interrupted by a crash.
    pub fn open(data_root: impl Into<PathBuf>, archive_root: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let data_root = data_root.into();
        let archive_root = archive_root.into();
        for dir in [&data_root, &archive_root] {
            fs::create_dir_all(dir)
                .map_err(|source| HistoryError::io(format!("failed to create `{}`", dir.display()), source))?;
        }
        ensure_same_filesystem(&data_root, &archive_root)?;

        let mut projects = HashMap::new();
        let entries = fs::read_dir(&data_root).map_err(|source| {
            HistoryError::io(format!("failed to list data root `{}`", data_root.display()), source)
        })?;
        for entry in entries.filter_map(Result::ok) {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(project_id) = ProjectId::new(name.clone()) else {
                warn!(dir = %name, "ignoring directory that is not a valid project id");
                continue;
            };

            let layout = ProjectLayout::new(&data_root, &archive_root, &project_id);
            recover_interrupted_squash(&layout)?;
            let state = ProjectState::load(&layout)?;
            info!(
                project_id = %project_id,
                start = %state.log.start(),
                head = %state.log.head(),
                archived_segments = state.archive.segments().len(),
                "opened project history"
            );
            projects.insert(project_id, Arc::new(ProjectHistory::new(layout, state)));
        }

        Ok(Self { data_root, archive_root, projects: RwLock::new(projects) })
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    /// Create an empty project: a log starting at revision 0 and an empty
    /// baseline snapshot.
    pub async fn create_project(&self, project_id: &ProjectId) -> Result<Arc<ProjectHistory>, HistoryError> {
        let mut projects = self.projects.write().await;
        if projects.contains_key(project_id) {
            return Err(HistoryError::AlreadyExists(project_id.clone()));
        }

        let layout = ProjectLayout::new(&self.data_root, &self.archive_root, project_id);
        if layout.log().exists() {
            return Err(HistoryError::AlreadyExists(project_id.clone()));
        }
        fs::create_dir_all(&layout.dir).map_err(|source| {
            HistoryError::io(format!("failed to create project dir `{}`", layout.dir.display()), source)
        })?;
        write_snapshot(&layout.snapshot(), &Snapshot::empty())?;
        RevisionLog::create(layout.log(), DocumentRevision::START)?;

        let project = Arc::new(ProjectHistory::new(layout.clone(), ProjectState::load(&layout)?));
        projects.insert(project_id.clone(), project.clone());
        info!(project_id = %project_id, "created project history");
        Ok(project)
    }

    /// Create the project unless it is already open.
    pub async fn ensure_project(&self, project_id: &ProjectId) -> Result<Arc<ProjectHistory>, HistoryError> {
        if let Some(project) = self.projects.read().await.get(project_id).cloned() {
            return Ok(project);
        }
        match self.create_project(project_id).await {
            Err(HistoryError::AlreadyExists(_)) => self.project(project_id).await,
            other => other,
        }
    }

    pub async fn project(&self, project_id: &ProjectId) -> Result<Arc<ProjectHistory>, HistoryError> {
        self.projects
            .read()
            .await
            .get(project_id)
            .cloned()
            .ok_or_else(|| HistoryError::NotFound(format!("unknown project `{project_id}`")))
    }

    pub async fn project_ids(&self) -> Vec<ProjectId> {
        let mut ids: Vec<_> = self.projects.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn head(&self, project_id: &ProjectId) -> Result<HeadInfo, HistoryError> {
        Ok(self.project(project_id).await?.head().await)
    }

    pub async fn changes(
        &self,
        project_id: &ProjectId,
        start_exclusive: DocumentRevision,
        end_inclusive: DocumentRevision,
    ) -> Result<ChangeHistory, HistoryError> {
        self.project(project_id).await?.changes(start_exclusive, end_inclusive).await
    }

    pub async fn all_changes(&self, project_id: &ProjectId) -> Result<ChangeHistory, HistoryError> {
        self.project(project_id).await?.all_changes().await
    }

    pub async fn materialize(
        &self,
        project_id: &ProjectId,
        revision: DocumentRevision,
        applier: &dyn DocumentApplier,
    ) -> Result<Value, HistoryError> {
        self.project(project_id).await?.materialize(revision, applier).await
    }
}

/// Squash moves files between the two roots with `rename`, which cannot
/// cross a filesystem boundary.
#[cfg(unix)]
fn ensure_same_filesystem(data_root: &Path, archive_root: &Path) -> Result<(), HistoryError> {
    use std::os::unix::fs::MetadataExt;

    let device = |dir: &Path| {
        fs::metadata(dir)
            .map(|meta| meta.dev())
            .map_err(|source| HistoryError::io(format!("failed to stat `{}`", dir.display()), source))
    };
    if device(data_root)? != device(archive_root)? {
        return Err(HistoryError::CrossDevice {
            data_root: data_root.to_path_buf(),
            archive_root: archive_root.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_same_filesystem(_data_root: &Path, _archive_root: &Path) -> Result<(), HistoryError> {
    Ok(())
}
