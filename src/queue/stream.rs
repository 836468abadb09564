use crate::queue::QueueError;
use crate::record::LogRecord;
use chrono::Utc;
use crc32c::crc32c;
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

const SEGMENT_MAGIC: &[u8; 8] = b"DLQSEG01";
const SEGMENT_VERSION: u32 = 1;
const SEGMENT_HEADER_LEN: usize = 64;
const MAX_ENTRY_LEN: u32 = 1024 * 1024;

/// Append-only stream of log records persisted in CRC-framed segment files.
///
/// Segment layout: a 64-byte header (magic, version, stream id, start id)
/// followed by `[len u32][crc32c u32][payload]` frames where the payload is
/// the 8-byte little-endian ingest id and the JSON-encoded record. The open
/// segment is `seg-<uuid>-<start>.open`; rolled segments are renamed to
/// `seg-<uuid>-<start>-<end>.seg` and become immutable.
pub(crate) struct StreamStore {
    dir: PathBuf,
    stream_id: Uuid,
    segment: SegmentWriter,
    entries: BTreeMap<u64, Arc<LogRecord>>,
    first_id: u64,
    next_id: u64,
    roll_bytes: u64,
}

struct SegmentWriter {
    path: PathBuf,
    file: fs::File,
    start_id: u64,
    last_id: Option<u64>,
    bytes: u64,
}

impl StreamStore {
    /// Open the stream in `dir`, rebuilding the in-memory index from segment
    /// files. A torn tail on the open segment (crash mid-append) is truncated;
    /// corruption inside a closed segment is fatal.
    pub(crate) fn open(
        dir: &Path,
        stream_id: Uuid,
        floor_next_id: u64,
        first_id: u64,
        roll_bytes: u64,
    ) -> Result<Self, QueueError> {
        fs::create_dir_all(dir)
            .map_err(|err| QueueError::Storage(format!("create {}: {err}", dir.display())))?;

        let mut entries = BTreeMap::new();
        let mut closed = list_closed_segments(dir, stream_id)?;
        closed.sort_by_key(|seg| seg.start_id);
        for seg in &closed {
            read_segment_entries(&seg.path, &mut entries, false)?;
        }

        let open_path = find_open_segment(dir, stream_id)?;
        let segment = match open_path {
            Some(path) => {
                let mut file = fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|err| QueueError::Storage(format!("open {}: {err}", path.display())))?;
                truncate_torn_tail(&mut file)?;
                let last_id = read_segment_entries(&path, &mut entries, true)?;
                let start_id = parse_open_start_id(&path).unwrap_or(floor_next_id);
                let bytes = file
                    .metadata()
                    .map_err(|err| QueueError::Storage(err.to_string()))?
                    .len();
                file.seek(SeekFrom::End(0))
                    .map_err(|err| QueueError::Storage(err.to_string()))?;
                SegmentWriter {
                    path,
                    file,
                    start_id,
                    last_id,
                    bytes,
                }
            }
            None => {
                let start = entries
                    .keys()
                    .next_back()
                    .map(|id| id + 1)
                    .unwrap_or(floor_next_id)
                    .max(floor_next_id);
                create_segment(dir, stream_id, start)?
            }
        };

        let max_seen = entries.keys().next_back().copied();
        let next_id = max_seen.map(|id| id + 1).unwrap_or(1).max(floor_next_id);
        let first_id = first_id.max(1);
        // Entries below the persisted trim floor belong to segments that were
        // about to be deleted when the process died; drop them again.
        entries.retain(|id, _| *id >= first_id);

        Ok(Self {
            dir: dir.to_path_buf(),
            stream_id,
            segment,
            entries,
            first_id,
            next_id,
            roll_bytes,
        })
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id
    }

    pub(crate) fn first_id(&self) -> u64 {
        self.first_id
    }

    pub(crate) fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub(crate) fn get(&self, id: u64) -> Option<Arc<LogRecord>> {
        self.entries.get(&id).cloned()
    }

    /// Up to `count` entries with ids strictly greater than `after`, in order.
    pub(crate) fn range_after(&self, after: u64, count: usize) -> Vec<(u64, Arc<LogRecord>)> {
        self.entries
            .range(after.saturating_add(1)..)
            .take(count)
            .map(|(id, record)| (*id, record.clone()))
            .collect()
    }

    /// Append one record, assigning the next ingest id. The caller syncs.
    pub(crate) fn append(&mut self, record: LogRecord) -> Result<u64, QueueError> {
        let id = self.next_id;
        let record = Arc::new(record);

        let mut payload = Vec::with_capacity(128);
        payload.extend_from_slice(&id.to_le_bytes());
        serde_json::to_writer(&mut payload, record.as_ref())
            .map_err(|err| QueueError::Storage(format!("encode record {id}: {err}")))?;
        if payload.len() as u32 > MAX_ENTRY_LEN {
            return Err(QueueError::Storage(format!(
                "record {id} exceeds the {MAX_ENTRY_LEN} byte frame limit"
            )));
        }

        let len = payload.len() as u32;
        let crc = crc32c(&payload);
        self.segment
            .file
            .write_all(&len.to_le_bytes())
            .and_then(|_| self.segment.file.write_all(&crc.to_le_bytes()))
            .and_then(|_| self.segment.file.write_all(&payload))
            .map_err(|err| QueueError::Storage(format!("append to {}: {err}", self.segment.path.display())))?;
        self.segment.bytes += 8 + payload.len() as u64;
        self.segment.last_id = Some(id);

        self.next_id = id + 1;
        self.entries.insert(id, record);

        if self.segment.bytes >= self.roll_bytes {
            self.roll_segment()?;
        }
        Ok(id)
    }

    pub(crate) fn sync(&mut self) -> Result<(), QueueError> {
        self.segment
            .file
            .sync_data()
            .map_err(|err| QueueError::Storage(format!("sync {}: {err}", self.segment.path.display())))
    }

    /// Drop entries below `min_id` and delete fully-covered closed segments.
    /// Returns the number of entries removed.
    pub(crate) fn trim(&mut self, min_id: u64) -> Result<u64, QueueError> {
        if min_id <= self.first_id {
            return Ok(0);
        }
        let before = self.entries.len();
        self.entries = self.entries.split_off(&min_id);
        self.first_id = min_id;

        for seg in list_closed_segments(&self.dir, self.stream_id)? {
            if seg.end_id < min_id {
                if let Err(err) = fs::remove_file(&seg.path) {
                    tracing::warn!(path = %seg.path.display(), error = %err, "failed to delete trimmed segment");
                }
            }
        }
        Ok((before - self.entries.len()) as u64)
    }

    fn roll_segment(&mut self) -> Result<(), QueueError> {
        let Some(last_id) = self.segment.last_id else {
            return Ok(());
        };
        self.segment
            .file
            .sync_data()
            .map_err(|err| QueueError::Storage(err.to_string()))?;
        let closed = closed_segment_path(&self.dir, self.stream_id, self.segment.start_id, last_id);
        fs::rename(&self.segment.path, &closed).map_err(|err| {
            QueueError::Storage(format!(
                "rename {} -> {}: {err}",
                self.segment.path.display(),
                closed.display()
            ))
        })?;
        self.segment = create_segment(&self.dir, self.stream_id, self.next_id)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ClosedSegment {
    path: PathBuf,
    start_id: u64,
    end_id: u64,
}

fn open_segment_path(dir: &Path, stream_id: Uuid, start_id: u64) -> PathBuf {
    dir.join(format!("seg-{stream_id}-{start_id}.open"))
}

fn closed_segment_path(dir: &Path, stream_id: Uuid, start_id: u64, end_id: u64) -> PathBuf {
    dir.join(format!("seg-{stream_id}-{start_id}-{end_id}.seg"))
}

fn list_closed_segments(dir: &Path, stream_id: Uuid) -> Result<Vec<ClosedSegment>, QueueError> {
    let prefix = format!("seg-{stream_id}-");
    let mut out = Vec::new();
    let iter = fs::read_dir(dir)
        .map_err(|err| QueueError::Storage(format!("read {}: {err}", dir.display())))?;
    for entry in iter {
        let entry = entry.map_err(|err| QueueError::Storage(err.to_string()))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        if !name.starts_with(&prefix) || !name.ends_with(".seg") {
            continue;
        }
        let range = name
            .trim_start_matches(&prefix)
            .trim_end_matches(".seg")
            .split_once('-');
        if let Some((start, end)) = range {
            if let (Ok(start_id), Ok(end_id)) = (start.parse(), end.parse()) {
                out.push(ClosedSegment {
                    path,
                    start_id,
                    end_id,
                });
            }
        }
    }
    Ok(out)
}

fn find_open_segment(dir: &Path, stream_id: Uuid) -> Result<Option<PathBuf>, QueueError> {
    let prefix = format!("seg-{stream_id}-");
    let iter = fs::read_dir(dir)
        .map_err(|err| QueueError::Storage(format!("read {}: {err}", dir.display())))?;
    for entry in iter {
        let entry = entry.map_err(|err| QueueError::Storage(err.to_string()))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        if name.starts_with(&prefix) && name.ends_with(".open") {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

fn parse_open_start_id(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.trim_end_matches(".open").rsplit('-').next()?.parse().ok()
}

fn create_segment(dir: &Path, stream_id: Uuid, start_id: u64) -> Result<SegmentWriter, QueueError> {
    let path = open_segment_path(dir, stream_id, start_id);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|err| QueueError::Storage(format!("create {}: {err}", path.display())))?;

    let mut header = vec![0u8; SEGMENT_HEADER_LEN];
    header[0..8].copy_from_slice(SEGMENT_MAGIC);
    header[8..12].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
    header[12..16].copy_from_slice(&(SEGMENT_HEADER_LEN as u32).to_le_bytes());
    header[16..32].copy_from_slice(stream_id.as_bytes());
    header[32..40].copy_from_slice(&Utc::now().timestamp_millis().to_le_bytes());
    header[40..48].copy_from_slice(&start_id.to_le_bytes());
    file.write_all(&header)
        .map_err(|err| QueueError::Storage(format!("write header {}: {err}", path.display())))?;
    file.sync_data().ok();

    Ok(SegmentWriter {
        path,
        file,
        start_id,
        last_id: None,
        bytes: SEGMENT_HEADER_LEN as u64,
    })
}

/// Read every valid frame of a segment into `entries`. For the open segment
/// (`tolerate_tail`) an invalid frame marks the end of good data; for closed
/// segments it is corruption and fails the open.
fn read_segment_entries(
    path: &Path,
    entries: &mut BTreeMap<u64, Arc<LogRecord>>,
    tolerate_tail: bool,
) -> Result<Option<u64>, QueueError> {
    let mut file = fs::File::open(path)
        .map_err(|err| QueueError::Storage(format!("open {}: {err}", path.display())))?;
    let mut header = [0u8; SEGMENT_HEADER_LEN];
    file.read_exact(&mut header)
        .map_err(|err| QueueError::Storage(format!("read header {}: {err}", path.display())))?;
    if &header[0..8] != SEGMENT_MAGIC {
        return Err(QueueError::Storage(format!(
            "{} is not a queue segment",
            path.display()
        )));
    }

    let mut last_id = None;
    loop {
        let mut frame = [0u8; 8];
        match file.read_exact(&mut frame) {
            Ok(()) => {}
            Err(_) => break,
        }
        let len = u32::from_le_bytes(frame[0..4].try_into().unwrap());
        let crc = u32::from_le_bytes(frame[4..8].try_into().unwrap());
        if len < 8 || len > MAX_ENTRY_LEN {
            if tolerate_tail {
                break;
            }
            return Err(QueueError::Storage(format!(
                "corrupt frame length in {}",
                path.display()
            )));
        }
        let mut payload = vec![0u8; len as usize];
        if file.read_exact(&mut payload).is_err() || crc32c(&payload) != crc {
            if tolerate_tail {
                break;
            }
            return Err(QueueError::Storage(format!(
                "corrupt frame in {}",
                path.display()
            )));
        }
        let id = u64::from_le_bytes(payload[0..8].try_into().unwrap());
        let record: LogRecord = serde_json::from_slice(&payload[8..])
            .map_err(|err| QueueError::Storage(format!("decode record {id}: {err}")))?;
        entries.insert(id, Arc::new(record));
        last_id = Some(id);
    }
    Ok(last_id)
}

/// Truncate a partially written frame left by a crash mid-append.
fn truncate_torn_tail(file: &mut fs::File) -> Result<(), QueueError> {
    let end = file
        .metadata()
        .map_err(|err| QueueError::Storage(err.to_string()))?
        .len();
    if end < SEGMENT_HEADER_LEN as u64 {
        return Err(QueueError::Storage("segment shorter than its header".to_string()));
    }
    file.seek(SeekFrom::Start(SEGMENT_HEADER_LEN as u64))
        .map_err(|err| QueueError::Storage(err.to_string()))?;
    let mut pos = SEGMENT_HEADER_LEN as u64;
    loop {
        let mut frame = [0u8; 8];
        if file.read_exact(&mut frame).is_err() {
            break;
        }
        let len = u32::from_le_bytes(frame[0..4].try_into().unwrap());
        let crc = u32::from_le_bytes(frame[4..8].try_into().unwrap());
        if len < 8 || len > MAX_ENTRY_LEN {
            break;
        }
        let mut payload = vec![0u8; len as usize];
        if file.read_exact(&mut payload).is_err() || crc32c(&payload) != crc {
            break;
        }
        pos += 8 + len as u64;
    }
    file.set_len(pos)
        .map_err(|err| QueueError::Storage(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogLevel;

    fn record(message: &str) -> LogRecord {
        LogRecord {
            device_id: "dev-1".to_string(),
            log_level: LogLevel::Info,
            message: message.to_string(),
            timestamp: Utc::now(),
            log_data: None,
        }
    }

    fn open_store(dir: &Path, stream_id: Uuid) -> StreamStore {
        StreamStore::open(dir, stream_id, 1, 1, 64 * 1024).unwrap()
    }

    #[test]
    fn appends_assign_monotonic_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path(), Uuid::new_v4());
        assert_eq!(store.append(record("a")).unwrap(), 1);
        assert_eq!(store.append(record("b")).unwrap(), 2);
        assert_eq!(store.len(), 2);
        let tail = store.range_after(0, 10);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].1.message, "a");
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let stream_id = Uuid::new_v4();
        {
            let mut store = open_store(dir.path(), stream_id);
            for i in 0..5 {
                store.append(record(&format!("m{i}"))).unwrap();
            }
            store.sync().unwrap();
        }
        let store = open_store(dir.path(), stream_id);
        assert_eq!(store.len(), 5);
        assert_eq!(store.next_id(), 6);
        assert_eq!(store.get(3).unwrap().message, "m2");
    }

    #[test]
    fn truncates_torn_tail_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let stream_id = Uuid::new_v4();
        let open_path;
        {
            let mut store = open_store(dir.path(), stream_id);
            store.append(record("good")).unwrap();
            store.sync().unwrap();
            open_path = store.segment.path.clone();
        }
        // Simulate a crash mid-frame: append garbage that parses as a frame
        // header but has no payload behind it.
        let mut file = fs::OpenOptions::new().append(true).open(&open_path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&0xdeadbeefu32.to_le_bytes()).unwrap();
        file.write_all(b"partial").unwrap();
        drop(file);

        let mut store = open_store(dir.path(), stream_id);
        assert_eq!(store.len(), 1);
        assert_eq!(store.next_id(), 2);
        assert_eq!(store.append(record("after")).unwrap(), 2);
    }

    #[test]
    fn rolls_segments_and_trims_closed_ones() {
        let dir = tempfile::tempdir().unwrap();
        let stream_id = Uuid::new_v4();
        let mut store = StreamStore::open(dir.path(), stream_id, 1, 1, 256).unwrap();
        for i in 0..20 {
            store.append(record(&format!("payload-{i}"))).unwrap();
        }
        let closed_before = list_closed_segments(dir.path(), stream_id).unwrap().len();
        assert!(closed_before > 0, "expected at least one rolled segment");

        let removed = store.trim(15).unwrap();
        assert_eq!(removed, 14);
        assert_eq!(store.first_id(), 15);
        assert!(store.get(14).is_none());
        assert!(store.get(15).is_some());
        let closed_after = list_closed_segments(dir.path(), stream_id).unwrap().len();
        assert!(closed_after < closed_before);
    }

    #[test]
    fn next_id_never_regresses_below_floor() {
        let dir = tempfile::tempdir().unwrap();
        let stream_id = Uuid::new_v4();
        // All entries trimmed and segments gone; the persisted floor must win.
        let store = StreamStore::open(dir.path(), stream_id, 42, 42, 64 * 1024).unwrap();
        assert_eq!(store.next_id(), 42);
        assert_eq!(store.first_id(), 42);
    }

    #[test]
    fn rejects_corrupt_closed_segment() {
        let dir = tempfile::tempdir().unwrap();
        let stream_id = Uuid::new_v4();
        {
            let mut store = StreamStore::open(dir.path(), stream_id, 1, 1, 256).unwrap();
            for i in 0..20 {
                store.append(record(&format!("payload-{i}"))).unwrap();
            }
        }
        let seg = list_closed_segments(dir.path(), stream_id)
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        let mut bytes = fs::read(&seg.path).unwrap();
        let mid = bytes.len() - 4;
        bytes[mid] ^= 0xff;
        fs::write(&seg.path, bytes).unwrap();

        let result = StreamStore::open(dir.path(), stream_id, 1, 1, 256);
        assert!(result.is_err());
    }
}
