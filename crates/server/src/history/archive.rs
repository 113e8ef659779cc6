use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use chronicle_common::history::ChangeHistory;
use chronicle_common::types::{DocumentRevision, Snapshot};
use tracing::warn;

use super::log::{RevisionLog, LOG_FILE_NAME};
use super::snapshot::{read_snapshot, SNAPSHOT_FILE_NAME};
use super::HistoryError;

const SEGMENT_PREFIX: &str = "squash-";

/// Directory name for a squash performed at `at`. Names sort chronologically.
pub fn segment_dir_name(at: DateTime<Utc>) -> String {
    format!("{SEGMENT_PREFIX}{}", at.format("%Y%m%dT%H%M%S%.3fZ"))
}

/// A log and snapshot moved out of the active project directory by a squash.
#[derive(Debug)]
pub struct ArchivedSegment {
    dir: PathBuf,
    log: RevisionLog,
}

impl ArchivedSegment {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let dir = dir.into();
        let log = RevisionLog::open_read_only(dir.join(LOG_FILE_NAME))?;
        Ok(Self { dir, log })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn start(&self) -> DocumentRevision {
        self.log.start()
    }

    pub fn head(&self) -> DocumentRevision {
        self.log.head()
    }

    pub fn log(&self) -> &RevisionLog {
        &self.log
    }

    /// The baseline this segment's log was replayed from.
    pub fn snapshot(&self) -> Result<Snapshot, HistoryError> {
        read_snapshot(&self.dir.join(SNAPSHOT_FILE_NAME))
    }

    fn covers(&self, revision: DocumentRevision) -> bool {
        self.start() <= revision && revision <= self.head()
    }
}

/// Archived segments of one project, oldest first, forming an unbroken
/// chain of revisions that ends where the active log starts.
#[derive(Debug, Default)]
pub struct ArchiveIndex {
    segments: Vec<ArchivedSegment>,
}

impl ArchiveIndex {
    /// Scan `project_archive_dir` for segments that chain into `active_start`.
    ///
    /// Segments that cannot be opened or that leave a gap before the chain
    /// are skipped with a warning; the rest of the history stays readable.
    pub fn load(project_archive_dir: &Path, active_start: DocumentRevision) -> Result<Self, HistoryError> {
        let read_dir = match fs::read_dir(project_archive_dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(HistoryError::io(
                    format!("failed to list archive `{}`", project_archive_dir.display()),
                    source,
                ))
            }
        };

        let mut dirs: Vec<PathBuf> = read_dir
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(SEGMENT_PREFIX))
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();

        let mut candidates = Vec::with_capacity(dirs.len());
        for dir in dirs {
            match ArchivedSegment::open(&dir) {
                Ok(segment) => candidates.push(segment),
                Err(err) => warn!(segment = %dir.display(), error = %err, "skipping unreadable archive segment"),
            }
        }
        candidates.sort_by(|a, b| a.start().cmp(&b.start()).then_with(|| a.dir.cmp(&b.dir)));

        // Walk back from the active log, keeping each segment that ends
        // exactly where the next one starts.
        let mut expected_head = active_start;
        let mut chain = Vec::with_capacity(candidates.len());
        while let Some(segment) = candidates.pop() {
            if segment.head() == expected_head {
                expected_head = segment.start();
                chain.push(segment);
            } else {
                warn!(
                    segment = %segment.dir.display(),
                    start = %segment.start(),
                    head = %segment.head(),
                    expected_head = %expected_head,
                    "archive segment does not chain into later history"
                );
            }
        }
        chain.reverse();
        Ok(Self { segments: chain })
    }

    pub fn segments(&self) -> &[ArchivedSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// First revision any archived segment can serve from.
    pub fn earliest_start(&self) -> Option<DocumentRevision> {
        self.segments.first().map(ArchivedSegment::start)
    }

    /// Newest segment whose revision range includes `revision`.
    pub fn segment_containing(&self, revision: DocumentRevision) -> Option<&ArchivedSegment> {
        self.segments.iter().rev().find(|segment| segment.covers(revision))
    }

    /// Archived entries in `(start_exclusive, end_inclusive]`, stitched
    /// across segment boundaries. `end_inclusive` is clamped to the last
    /// archived revision.
    pub fn range(
        &self,
        start_exclusive: DocumentRevision,
        end_inclusive: DocumentRevision,
    ) -> Result<ChangeHistory, HistoryError> {
        let earliest = self
            .earliest_start()
            .ok_or_else(|| HistoryError::NotFound(format!("no archived history before {start_exclusive}")))?;
        let archive_head = self.segments.last().map(ArchivedSegment::head).unwrap_or(earliest);
        if start_exclusive < earliest || start_exclusive > archive_head {
            return Err(HistoryError::OutOfRange { start: start_exclusive, log_start: earliest, head: archive_head });
        }

        let end = end_inclusive.min(archive_head);
        let mut history = ChangeHistory::starting_at(start_exclusive);
        for segment in &self.segments {
            if segment.head() <= history.head() || segment.start() >= end {
                continue;
            }
            let part = segment.log().range(history.head(), end.min(segment.head()))?;
            history = history.concat(part)?;
        }
        Ok(history)
    }
}
