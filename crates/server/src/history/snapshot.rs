use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chronicle_common::types::{DocumentRevision, Snapshot};

use super::HistoryError;

pub const SNAPSHOT_FILE_NAME: &str = "history.log-snapshot";

const SNAPSHOT_MAGIC: [u8; 4] = *b"SNP1";
const SNAPSHOT_VERSION: u8 = 1;
const SNAPSHOT_HEADER_BYTES: usize = 17;

/// Write `snapshot` to `target` through a temp file, fsync and rename, so a
/// reader sees either the old file or the complete new one.
///
/// Layout: `[magic "SNP1"][version: u8][revision: u64 LE][len: u32 LE][JSON]`.
pub fn write_snapshot(target: &Path, snapshot: &Snapshot) -> Result<(), HistoryError> {
    let payload = serde_json::to_vec(snapshot).map_err(HistoryError::Encode)?;
    let len = u32::try_from(payload.len()).map_err(|_| HistoryError::TooLarge(payload.len()))?;

    let mut header = [0u8; SNAPSHOT_HEADER_BYTES];
    header[..4].copy_from_slice(&SNAPSHOT_MAGIC);
    header[4] = SNAPSHOT_VERSION;
    header[5..13].copy_from_slice(&snapshot.revision.get().to_le_bytes());
    header[13..17].copy_from_slice(&len.to_le_bytes());

    let tmp_path = temp_path_for(target);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|source| {
            HistoryError::io(format!("failed to open temp snapshot `{}`", tmp_path.display()), source)
        })?;
    file.write_all(&header)
        .and_then(|_| file.write_all(&payload))
        .and_then(|_| file.sync_data())
        .map_err(|source| HistoryError::io(format!("failed to write snapshot `{}`", tmp_path.display()), source))?;
    drop(file);

    fs::rename(&tmp_path, target).map_err(|source| {
        let _ = fs::remove_file(&tmp_path);
        HistoryError::io(
            format!("failed to move snapshot `{}` to `{}`", tmp_path.display(), target.display()),
            source,
        )
    })
}

/// Read and validate a snapshot file.
pub fn read_snapshot(path: &Path) -> Result<Snapshot, HistoryError> {
    let mut file = File::open(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            HistoryError::NotFound(format!("no snapshot at `{}`", path.display()))
        } else {
            HistoryError::io(format!("failed to open snapshot `{}`", path.display()), source)
        }
    })?;

    let mut header = [0u8; SNAPSHOT_HEADER_BYTES];
    file.read_exact(&mut header).map_err(|_| HistoryError::corrupt(path, "truncated snapshot header"))?;
    if header[..4] != SNAPSHOT_MAGIC {
        return Err(HistoryError::corrupt(path, "invalid snapshot magic"));
    }
    if header[4] != SNAPSHOT_VERSION {
        return Err(HistoryError::corrupt(path, format!("unsupported snapshot version {}", header[4])));
    }
    let revision =
        DocumentRevision::new(u64::from_le_bytes(header[5..13].try_into().expect("revision header slice")));
    let expected_len = u32::from_le_bytes(header[13..17].try_into().expect("length header slice")) as usize;

    let mut payload = Vec::new();
    file.read_to_end(&mut payload)
        .map_err(|source| HistoryError::io(format!("failed to read snapshot `{}`", path.display()), source))?;
    if payload.len() != expected_len {
        return Err(HistoryError::corrupt(
            path,
            format!("payload length mismatch: expected {expected_len}, got {}", payload.len()),
        ));
    }

    let snapshot: Snapshot = serde_json::from_slice(&payload)
        .map_err(|err| HistoryError::corrupt(path, format!("invalid snapshot payload: {err}")))?;
    if snapshot.revision != revision {
        return Err(HistoryError::corrupt(
            path,
            format!("header revision {revision} disagrees with payload revision {}", snapshot.revision),
        ));
    }
    Ok(snapshot)
}

fn temp_path_for(target: &Path) -> PathBuf {
    let nonce = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or_default();
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".tmp.{nonce}"));
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn write_then_read_returns_same_snapshot() {
        let tmp = tempdir().expect("tempdir should be created");
        let path = tmp.path().join(SNAPSHOT_FILE_NAME);
        let snapshot = Snapshot {
            revision: DocumentRevision::new(42),
            document: json!({"classes": ["Pizza", "Topping"]}),
        };

        write_snapshot(&path, &snapshot).expect("snapshot should write");
        assert_eq!(read_snapshot(&path).expect("snapshot should read"), snapshot);

        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp files should be renamed away");
    }

    #[test]
    fn overwrite_replaces_previous_snapshot() {
        let tmp = tempdir().expect("tempdir should be created");
        let path = tmp.path().join(SNAPSHOT_FILE_NAME);
        write_snapshot(&path, &Snapshot::empty()).expect("first write");
        let later = Snapshot { revision: DocumentRevision::new(3), document: json!({"v": 3}) };
        write_snapshot(&path, &later).expect("second write");
        assert_eq!(read_snapshot(&path).expect("read"), later);
    }

    #[test]
    fn missing_snapshot_is_not_found() {
        let tmp = tempdir().expect("tempdir should be created");
        assert!(matches!(
            read_snapshot(&tmp.path().join(SNAPSHOT_FILE_NAME)),
            Err(HistoryError::NotFound(_))
        ));
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let tmp = tempdir().expect("tempdir should be created");
        let path = tmp.path().join(SNAPSHOT_FILE_NAME);
        write_snapshot(&path, &Snapshot { revision: DocumentRevision::new(1), document: json!("abc") })
            .expect("write");
        let bytes = fs::read(&path).expect("read bytes");
        fs::write(&path, &bytes[..bytes.len() - 2]).expect("truncate");
        assert!(matches!(read_snapshot(&path), Err(HistoryError::Corrupt { .. })));
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let tmp = tempdir().expect("tempdir should be created");
        let path = tmp.path().join(SNAPSHOT_FILE_NAME);
        fs::write(&path, [0u8; SNAPSHOT_HEADER_BYTES]).expect("write zeros");
        assert!(matches!(read_snapshot(&path), Err(HistoryError::Corrupt { .. })));
    }
}
