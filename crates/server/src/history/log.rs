use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chronicle_common::history::ChangeHistory;
use chronicle_common::types::{ChangeMetadata, ChangeSet, DocumentRevision, RevisionEntry};
use tracing::{error, warn};

use super::HistoryError;

pub const LOG_FILE_NAME: &str = "history.log";

const LOG_MAGIC: [u8; 4] = *b"CHL1";
const LOG_VERSION: u8 = 1;
const LOG_HEADER_BYTES: u64 = 13;
const FRAME_HEADER_BYTES: usize = 8;
const MAX_ENTRY_BYTES: usize = 16 << 20;

/// Append-only revision log for one project.
///
/// File layout:
/// `[magic "CHL1"][version: u8][start revision: u64 LE]` followed by frames of
/// `[len: u32 LE][checksum: u32 LE][payload: JSON RevisionEntry]`.
///
/// The log keeps an in-memory index from revision to frame offset so range
/// reads seek straight to the first requested entry. It assumes a single
/// writer; callers serialize appends per project.
///
/// If a failed append cannot be rolled back, the log is poisoned: appends
/// and reads fail until it is reopened, which truncates the torn tail and
/// rebuilds the index.
#[derive(Debug)]
pub struct RevisionLog {
    path: PathBuf,
    start: DocumentRevision,
    head: DocumentRevision,
    offsets: Vec<u64>,
    end_offset: u64,
    read_only: bool,
    poisoned: bool,
}

impl RevisionLog {
    /// Create a new, empty log whose first entry will be `start.next()`.
    ///
    /// Fails if a file already exists at `path`.
    pub fn create(path: impl AsRef<Path>, start: DocumentRevision) -> Result<Self, HistoryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| {
                HistoryError::io(format!("failed to create log directory `{}`", parent.display()), source)
            })?;
        }

        let mut header = Vec::with_capacity(LOG_HEADER_BYTES as usize);
        header.extend_from_slice(&LOG_MAGIC);
        header.push(LOG_VERSION);
        header.extend_from_slice(&start.get().to_le_bytes());

        let mut file = OpenOptions::new().write(true).create_new(true).open(&path).map_err(|source| {
            HistoryError::io(format!("failed to create log `{}`", path.display()), source)
        })?;
        file.write_all(&header)
            .and_then(|_| file.sync_all())
            .map_err(|source| HistoryError::io(format!("failed to write log header `{}`", path.display()), source))?;

        Ok(Self {
            path,
            start,
            head: start,
            offsets: Vec::new(),
            end_offset: LOG_HEADER_BYTES,
            read_only: false,
            poisoned: false,
        })
    }

    /// Open an existing log for appending.
    ///
    /// A torn or corrupted tail is truncated back to the last intact frame.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        Self::open_with_mode(path.as_ref(), false)
    }

    /// Open an archived log. Nothing is truncated and `append` is refused.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        Self::open_with_mode(path.as_ref(), true)
    }

    fn open_with_mode(path: &Path, read_only: bool) -> Result<Self, HistoryError> {
        let file = File::open(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                HistoryError::NotFound(format!("no history log at `{}`", path.display()))
            } else {
                HistoryError::io(format!("failed to open log `{}`", path.display()), source)
            }
        })?;
        let file_len = file
            .metadata()
            .map_err(|source| HistoryError::io(format!("failed to stat log `{}`", path.display()), source))?
            .len();
        let mut reader = BufReader::new(file);

        let mut header = [0u8; LOG_HEADER_BYTES as usize];
        reader.read_exact(&mut header).map_err(|_| HistoryError::corrupt(path, "truncated log header"))?;
        if header[..4] != LOG_MAGIC {
            return Err(HistoryError::corrupt(path, "invalid log magic"));
        }
        if header[4] != LOG_VERSION {
            return Err(HistoryError::corrupt(path, format!("unsupported log version {}", header[4])));
        }
        let start = DocumentRevision::new(u64::from_le_bytes(
            header[5..13].try_into().expect("start revision slice has fixed length"),
        ));

        let mut offsets = Vec::new();
        let mut offset = LOG_HEADER_BYTES;
        let mut head = start;
        let mut torn_at = None;
        while offset < file_len {
            match read_frame(&mut reader)? {
                Some(entry) => {
                    let expected = head.next()?;
                    if entry.revision != expected {
                        return Err(HistoryError::corrupt(
                            path,
                            format!("entry at offset {offset} has {} where {expected} was expected", entry.revision),
                        ));
                    }
                    offsets.push(offset);
                    offset = reader.stream_position().map_err(|source| {
                        HistoryError::io(format!("failed to read position in `{}`", path.display()), source)
                    })?;
                    head = expected;
                }
                None => {
                    torn_at = Some(offset);
                    break;
                }
            }
        }
        drop(reader);

        if let Some(valid_len) = torn_at {
            if read_only {
                return Err(HistoryError::corrupt(path, format!("archived log is torn at offset {valid_len}")));
            }
            warn!(
                path = %path.display(),
                valid_len,
                file_len,
                "truncating torn history log tail"
            );
            truncate_log(path, valid_len)?;
        }

        Ok(Self { path: path.to_path_buf(), start, head, offsets, end_offset: offset, read_only, poisoned: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start(&self) -> DocumentRevision {
        self.start
    }

    pub fn head(&self) -> DocumentRevision {
        self.head
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn ensure_usable(&self) -> Result<(), HistoryError> {
        if self.poisoned {
            return Err(HistoryError::Poisoned(self.path.display().to_string()));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Durably append a change-set as revision `head().next()`.
    ///
    /// The frame is fsynced before this returns; an error means nothing was
    /// acknowledged.
    pub fn append(
        &mut self,
        changes: &ChangeSet,
        metadata: &ChangeMetadata,
    ) -> Result<DocumentRevision, HistoryError> {
        if self.read_only {
            return Err(HistoryError::ReadOnly(self.path.display().to_string()));
        }
        self.ensure_usable()?;

        let revision = self.head.next()?;
        let entry = RevisionEntry { revision, metadata: metadata.clone(), changes: changes.clone() };
        let payload = serde_json::to_vec(&entry).map_err(HistoryError::Encode)?;
        if payload.len() > MAX_ENTRY_BYTES {
            return Err(HistoryError::TooLarge(payload.len()));
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&checksum(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        let mut file = OpenOptions::new().append(true).open(&self.path).map_err(|source| {
            HistoryError::io(format!("failed to open log `{}` for append", self.path.display()), source)
        })?;
        if let Err(source) = file.write_all(&frame).and_then(|_| file.sync_data()) {
            // Drop any partial frame so the index and the file agree.
            self.record_rollback(file.set_len(self.end_offset).and_then(|_| file.sync_data()));
            return Err(HistoryError::io(format!("failed to append to log `{}`", self.path.display()), source));
        }

        self.offsets.push(self.end_offset);
        self.end_offset += frame.len() as u64;
        self.head = revision;
        Ok(revision)
    }

    pub(crate) fn record_rollback(&mut self, truncated: std::io::Result<()>) {
        if let Err(err) = truncated {
            error!(
                path = %self.path.display(),
                valid_len = self.end_offset,
                error = %err,
                "could not roll back partial append; poisoning history log"
            );
            self.poisoned = true;
        }
    }

    /// Entries with revision in `(start_exclusive, end_inclusive]`.
    ///
    /// `end_inclusive` past the head is clamped to the head. A start before
    /// this log's first revision or after its head is `NotFound`.
    pub fn range(
        &self,
        start_exclusive: DocumentRevision,
        end_inclusive: DocumentRevision,
    ) -> Result<ChangeHistory, HistoryError> {
        self.ensure_usable()?;
        let head = self.head();
        if start_exclusive > head || start_exclusive < self.start {
            return Err(HistoryError::OutOfRange { start: start_exclusive, log_start: self.start, head });
        }

        let end = end_inclusive.min(head);
        let mut history = ChangeHistory::starting_at(start_exclusive);
        if end <= start_exclusive {
            return Ok(history);
        }

        let first = start_exclusive.distance_from(self.start) as usize;
        let count = end.distance_from(start_exclusive) as usize;

        let mut file = File::open(&self.path).map_err(|source| {
            HistoryError::io(format!("failed to open log `{}` for reading", self.path.display()), source)
        })?;
        file.seek(SeekFrom::Start(self.offsets[first])).map_err(|source| {
            HistoryError::io(format!("failed to seek in log `{}`", self.path.display()), source)
        })?;
        let mut reader = BufReader::new(file);

        for _ in 0..count {
            let entry = read_frame(&mut reader)?
                .ok_or_else(|| HistoryError::corrupt(&self.path, "indexed frame is unreadable"))?;
            history.push_entry(entry)?;
        }
        Ok(history)
    }

    /// The whole log.
    pub fn read_all(&self) -> Result<ChangeHistory, HistoryError> {
        self.range(self.start, self.head())
    }
}

/// Read one frame. `Ok(None)` means the frame is torn or fails its checksum.
fn read_frame<R: Read>(reader: &mut R) -> Result<Option<RevisionEntry>, HistoryError> {
    let mut header = [0u8; FRAME_HEADER_BYTES];
    if reader.read_exact(&mut header).is_err() {
        return Ok(None);
    }

    let len = u32::from_le_bytes(header[..4].try_into().expect("frame length slice")) as usize;
    if len > MAX_ENTRY_BYTES {
        return Ok(None);
    }
    let expected_checksum = u32::from_le_bytes(header[4..].try_into().expect("frame checksum slice"));

    let mut payload = vec![0u8; len];
    if reader.read_exact(&mut payload).is_err() {
        return Ok(None);
    }
    if checksum(&payload) != expected_checksum {
        return Ok(None);
    }

    match serde_json::from_slice(&payload) {
        Ok(entry) => Ok(Some(entry)),
        Err(_) => Ok(None),
    }
}

fn checksum(payload: &[u8]) -> u32 {
    // FNV-1a 32-bit checksum for simple corruption detection.
    let mut hash = 0x811c9dc5u32;
    for byte in payload {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn truncate_log(path: &Path, offset: u64) -> Result<(), HistoryError> {
    let file = OpenOptions::new().write(true).open(path).map_err(|source| {
        HistoryError::io(format!("failed to open log `{}` for truncation", path.display()), source)
    })?;
    file.set_len(offset)
        .and_then(|_| file.sync_data())
        .map_err(|source| HistoryError::io(format!("failed to truncate log `{}` to {offset}", path.display()), source))
}
