//! On-disk FIFO of chunk files.
//!
//! Each live chunk is one newline-terminated text file in `data_dir`, named
//! after its index id (`{id:016x}.txt`). The newest chunk is the tail and is
//! the only file ever appended to; the oldest chunk is the read head. The
//! [`ChunkIndex`] is the source of truth for which chunks exist and in what
//! order; directory listings are only used by [`inspect`].
//!
//! The tail is held as an owned [`ChunkWriter`]. It is flushed and its size
//! persisted on rollover, when the head catches up with it, and on
//! [`ChunkStore::close`]. When a tail is reopened its file is rescanned, a
//! torn final line is cut off, and the recorded size is re-derived from the
//! complete lines.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Item, Result};
use crate::chunk_index::{ChunkIndex, ChunkRecord, IndexSummary};
use crate::config::BufferConfig;
use crate::error::{ChunkError, Error};

const CHUNK_SUFFIX: &str = ".txt";

/// Chunk id rendered the way it appears in file names and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkId(pub i64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// File name for chunk `id`.
#[must_use]
pub fn chunk_file_name(id: i64) -> String {
    format!("{}{CHUNK_SUFFIX}", ChunkId(id))
}

/// Inverse of [`chunk_file_name`]; `None` for anything else.
#[must_use]
pub fn parse_chunk_file_name(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(CHUNK_SUFFIX)?;
    if stem.len() != 16 || !stem.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(stem, 16).ok().map(|id| id as i64)
}

/// Storage settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkStoreConfig {
    pub data_dir: PathBuf,
    pub index_file: PathBuf,
    /// Maximum items per chunk file
    pub data_chunk: u64,
}

impl ChunkStoreConfig {
    #[must_use]
    pub fn from_config(config: &BufferConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            index_file: config.index_file.clone(),
            data_chunk: config.data_chunk,
        }
    }
}

/// A chunk read into memory but not yet deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedChunk {
    pub id: i64,
    pub items: Vec<Item>,
}

/// Result of [`ChunkStore::load_oldest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The index holds no chunks.
    Empty,
    /// The head record had no file; the record was dropped.
    Orphaned { id: i64 },
    Loaded(LoadedChunk),
}

/// Result of [`ChunkStore::read`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkRead {
    pub items: Vec<Item>,
    pub was_empty: bool,
}

/// Failed [`ChunkStore::write`]. The first `written` items of the batch are
/// durable in the store; the rest were not stored.
#[derive(Debug, thiserror::Error)]
#[error("{source} (after {written} items were stored)")]
pub struct WriteError {
    pub written: usize,
    #[source]
    pub source: Error,
}

impl From<WriteError> for Error {
    fn from(err: WriteError) -> Self {
        err.source
    }
}

/// Open tail chunk.
#[derive(Debug)]
struct ChunkWriter {
    id: i64,
    /// Complete lines in the file.
    count: u64,
    /// Byte length of the file up to the last complete append.
    len: u64,
    path: PathBuf,
    file: BufWriter<File>,
}

impl ChunkWriter {
    /// Append a whole segment or, on error, leave `count` and `len` as they
    /// were. The caller must [`discard`](Self::discard) the writer then.
    fn append(&mut self, items: &[Item]) -> Result<()> {
        let mut bytes = 0u64;
        for item in items {
            self.file
                .write_all(item)
                .and_then(|()| self.file.write_all(b"\n"))
                .map_err(io_error(&self.path))?;
            bytes += item.len() as u64 + 1;
        }
        self.file.flush().map_err(io_error(&self.path))?;
        self.count += items.len() as u64;
        self.len += bytes;
        Ok(())
    }

    /// Drop buffered bytes and cut the file back to its last complete
    /// append.
    fn discard(self) {
        let Self { id, len, file, .. } = self;
        let (file, _unflushed) = file.into_parts();
        if let Err(err) = file.set_len(len) {
            warn!(
                chunk_id = %ChunkId(id),
                error = %err,
                "Failed to roll back partial append; tail will be rescanned"
            );
        }
    }

    fn finish(mut self) -> Result<(i64, u64)> {
        self.file.flush().map_err(io_error(&self.path))?;
        self.file
            .get_ref()
            .sync_data()
            .map_err(io_error(&self.path))?;
        Ok((self.id, self.count))
    }
}

/// Chunk files plus their index.
#[derive(Debug)]
pub struct ChunkStore {
    data_dir: PathBuf,
    capacity: u64,
    index: ChunkIndex,
    writer: Option<ChunkWriter>,
    /// Chunk handed out by `load_oldest` and not yet retired. Never reopened
    /// for appending.
    leased: Option<i64>,
}

impl ChunkStore {
    /// Create the data directory, open the index and reopen the tail chunk
    /// if one exists.
    pub fn open(config: &ChunkStoreConfig) -> Result<Self> {
        create_dir(&config.data_dir)?;
        if let Some(parent) = config.index_file.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir(parent)?;
            }
        }
        let index = ChunkIndex::open(&config.index_file)?;
        let mut store = Self {
            data_dir: config.data_dir.clone(),
            capacity: config.data_chunk.max(1),
            index,
            writer: None,
            leased: None,
        };
        if let Some(record) = store.index.newest()? {
            store.writer = Some(store.open_writer(record)?);
        }
        Ok(store)
    }

    #[must_use]
    pub fn index(&self) -> &ChunkIndex {
        &self.index
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn chunk_path(&self, id: i64) -> PathBuf {
        self.data_dir.join(chunk_file_name(id))
    }

    /// Id of the open tail, if any.
    #[must_use]
    pub fn tail_id(&self) -> Option<i64> {
        self.writer.as_ref().map(|w| w.id)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.index.oldest()?.is_none())
    }

    pub fn summary(&self) -> Result<IndexSummary> {
        Ok(self.index.summary()?)
    }

    /// Append `items` in order, rolling over to a new chunk each time the
    /// tail holds `data_chunk` items. Nothing is written if any item
    /// contains a newline.
    ///
    /// On failure the error says how many leading items were stored, so the
    /// caller can hand back only the rest.
    pub fn write(&mut self, items: &[Item]) -> std::result::Result<(), WriteError> {
        if let Some(position) = items.iter().position(|item| item.contains(&b'\n')) {
            return Err(WriteError {
                written: 0,
                source: ChunkError::InvalidItem { position }.into(),
            });
        }

        let mut written = 0;
        while written < items.len() {
            match self.write_segment(&items[written..]) {
                Ok(count) => written += count,
                Err(source) => return Err(WriteError { written, source }),
            }
        }
        Ok(())
    }

    /// Write as much of `items` as fits in the tail, rolling over first if
    /// it is full.
    fn write_segment(&mut self, items: &[Item]) -> Result<usize> {
        let capacity = self.capacity;
        let writer = self.writable_tail()?;
        let room = capacity.saturating_sub(writer.count) as usize;
        let segment = &items[..room.min(items.len())];
        if let Err(err) = writer.append(segment) {
            // The next write reopens and rescans the file.
            if let Some(writer) = self.writer.take() {
                writer.discard();
            }
            return Err(err);
        }
        Ok(segment.len())
    }

    /// Read the oldest chunk without deleting it. Pair with [`retire`]
    /// once the items have been delivered.
    ///
    /// [`retire`]: Self::retire
    pub fn load_oldest(&mut self) -> Result<LoadOutcome> {
        let Some(record) = self.index.oldest()? else {
            return Ok(LoadOutcome::Empty);
        };

        if self.tail_id() == Some(record.id) {
            debug!(chunk_id = %ChunkId(record.id), "Closing tail chunk to read it");
            self.close_writer()?;
        }

        let path = self.chunk_path(record.id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(
                    chunk_id = %ChunkId(record.id),
                    items = record.size,
                    "Chunk file disappeared, dropping its index record"
                );
                self.index.delete_chunk(record.id)?;
                if self.leased == Some(record.id) {
                    self.leased = None;
                }
                return Ok(LoadOutcome::Orphaned { id: record.id });
            }
            Err(err) => return Err(io_error(&path)(err).into()),
        };

        let items = read_items(file, &path, record.id)?;
        if items.len() as u64 != record.size {
            debug!(
                chunk_id = %ChunkId(record.id),
                recorded = record.size,
                items = items.len(),
                "Chunk size differs from index record"
            );
        }
        self.leased = Some(record.id);
        Ok(LoadOutcome::Loaded(LoadedChunk {
            id: record.id,
            items,
        }))
    }

    /// Delete a chunk's file and then its index record. Both steps tolerate
    /// the target already being gone.
    pub fn retire(&mut self, id: i64) -> Result<()> {
        if self.tail_id() == Some(id) {
            self.writer = None;
        }
        let path = self.chunk_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_error(&path)(err).into()),
        }
        self.index.delete_chunk(id)?;
        if self.leased == Some(id) {
            self.leased = None;
        }
        debug!(chunk_id = %ChunkId(id), "Chunk retired");
        Ok(())
    }

    /// Load and delete the oldest chunk in one step.
    pub fn read(&mut self) -> Result<ChunkRead> {
        match self.load_oldest()? {
            LoadOutcome::Empty => Ok(ChunkRead {
                items: Vec::new(),
                was_empty: true,
            }),
            LoadOutcome::Orphaned { .. } => Ok(ChunkRead::default()),
            LoadOutcome::Loaded(chunk) => {
                self.retire(chunk.id)?;
                Ok(ChunkRead {
                    items: chunk.items,
                    was_empty: false,
                })
            }
        }
    }

    /// Flush the tail and persist its size.
    pub fn close(&mut self) -> Result<()> {
        self.close_writer()
    }

    fn close_writer(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            let (id, count) = writer.finish()?;
            self.index.set_size(id, count)?;
        }
        Ok(())
    }

    fn writable_tail(&mut self) -> Result<&mut ChunkWriter> {
        if self.writer.is_none() {
            let writer = match self.index.newest()? {
                Some(record) if self.leased != Some(record.id) => self.open_writer(record)?,
                _ => self.create_writer()?,
            };
            self.writer = Some(writer);
        }

        if self.writer.as_ref().is_some_and(|w| w.count >= self.capacity) {
            self.close_writer()?;
            let writer = self.create_writer()?;
            debug!(chunk_id = %ChunkId(writer.id), "Rolled over to new chunk");
            self.writer = Some(writer);
        }

        self.writer
            .as_mut()
            .ok_or_else(|| Error::Runtime("chunk writer unavailable".to_string()))
    }

    fn create_writer(&self) -> Result<ChunkWriter> {
        let id = self.index.create_chunk()?;
        self.open_writer(ChunkRecord { id, size: 0 })
    }

    fn open_writer(&self, record: ChunkRecord) -> Result<ChunkWriter> {
        let path = self.chunk_path(record.id);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(io_error(&path))?;

        let scan = scan_complete_lines(&mut file).map_err(io_error(&path))?;
        if scan.torn_bytes > 0 {
            warn!(
                chunk_id = %ChunkId(record.id),
                bytes = scan.torn_bytes,
                "Truncated unterminated line at end of tail chunk"
            );
        }
        if scan.lines != record.size {
            warn!(
                chunk_id = %ChunkId(record.id),
                recorded = record.size,
                items = scan.lines,
                "Reconciled tail chunk size with file contents"
            );
            self.index.set_size(record.id, scan.lines)?;
        }

        Ok(ChunkWriter {
            id: record.id,
            count: scan.lines,
            len: scan.valid_len,
            path,
            file: BufWriter::new(file),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct LineScan {
    lines: u64,
    valid_len: u64,
    torn_bytes: u64,
}

/// Count complete lines and cut off any unterminated remainder.
fn scan_complete_lines(file: &mut File) -> io::Result<LineScan> {
    file.seek(SeekFrom::Start(0))?;
    let file_len = file.metadata()?.len();

    let mut valid_len = 0u64;
    let mut lines = 0u64;
    {
        let mut reader = BufReader::new(&mut *file);
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 || line.last() != Some(&b'\n') {
                break;
            }
            valid_len += read as u64;
            lines += 1;
        }
    }

    if valid_len < file_len {
        file.set_len(valid_len)?;
        file.sync_data()?;
    }
    file.seek(SeekFrom::End(0))?;
    Ok(LineScan {
        lines,
        valid_len,
        torn_bytes: file_len - valid_len,
    })
}

fn read_items(file: File, path: &Path, id: i64) -> Result<Vec<Item>> {
    let mut reader = BufReader::new(file);
    let mut items = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(io_error(path))?;
        if read == 0 {
            break;
        }
        if line.last() != Some(&b'\n') {
            warn!(
                chunk_id = %ChunkId(id),
                bytes = read,
                "Dropping unterminated line at end of chunk"
            );
            break;
        }
        line.pop();
        items.push(std::mem::take(&mut line));
    }
    Ok(items)
}

fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|source| ChunkError::CreateDir {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ChunkError + '_ {
    move |source| ChunkError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read-only snapshot of the on-disk side, for `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreReport {
    pub summary: IndexSummary,
    pub records: Vec<ChunkRecord>,
    /// Chunk files with no index record.
    pub untracked_files: Vec<PathBuf>,
    /// Index records with no chunk file.
    pub missing_files: Vec<i64>,
}

impl StoreReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.untracked_files.is_empty() && self.missing_files.is_empty()
    }
}

/// Inspect storage without creating or repairing anything.
pub fn inspect(config: &ChunkStoreConfig) -> Result<StoreReport> {
    let (summary, records) = if config.index_file.exists() {
        let index = ChunkIndex::open_read_only(&config.index_file)?;
        (index.summary()?, index.records()?)
    } else {
        (IndexSummary::default(), Vec::new())
    };

    let mut on_disk = BTreeSet::new();
    if config.data_dir.is_dir() {
        let entries = std::fs::read_dir(&config.data_dir).map_err(io_error(&config.data_dir))?;
        for entry in entries {
            let entry = entry.map_err(io_error(&config.data_dir))?;
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(parse_chunk_file_name) {
                on_disk.insert(id);
            }
        }
    }

    let tracked: BTreeSet<i64> = records.iter().map(|r| r.id).collect();
    let untracked_files = on_disk
        .difference(&tracked)
        .map(|id| config.data_dir.join(chunk_file_name(*id)))
        .collect();
    let missing_files = tracked.difference(&on_disk).copied().collect();

    Ok(StoreReport {
        summary,
        records,
        untracked_files,
        missing_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn store_with(capacity: u64) -> (TempDir, ChunkStoreConfig, ChunkStore) {
        let dir = tempdir().unwrap();
        let config = ChunkStoreConfig {
            data_dir: dir.path().join("data"),
            index_file: dir.path().join("index.db"),
            data_chunk: capacity,
        };
        let store = ChunkStore::open(&config).unwrap();
        (dir, config, store)
    }

    fn items(range: std::ops::Range<u32>) -> Vec<Item> {
        range.map(|i| format!("item-{i}").into_bytes()).collect()
    }

    fn drain(store: &mut ChunkStore) -> Vec<Item> {
        let mut out = Vec::new();
        loop {
            let read = store.read().unwrap();
            if read.was_empty {
                return out;
            }
            out.extend(read.items);
        }
    }

    fn line_count(path: &Path) -> u64 {
        std::fs::read_to_string(path).unwrap().lines().count() as u64
    }

    #[test]
    fn chunk_file_names_are_fixed_width_hex() {
        assert_eq!(chunk_file_name(1), "0000000000000001.txt");
        assert_eq!(chunk_file_name(0xabc), "0000000000000abc.txt");
        assert_eq!(parse_chunk_file_name("0000000000000abc.txt"), Some(0xabc));
        assert_eq!(parse_chunk_file_name("abc.txt"), None);
        assert_eq!(parse_chunk_file_name("0000000000000abc.log"), None);
        assert_eq!(parse_chunk_file_name("000000000000zzzz.txt"), None);
    }

    #[test]
    fn read_on_empty_store_reports_empty_without_creating_records() {
        let (_dir, _config, mut store) = store_with(10);
        let read = store.read().unwrap();
        assert!(read.was_empty);
        assert!(read.items.is_empty());
        assert!(store.is_empty().unwrap());
        assert_eq!(store.summary().unwrap().chunks, 0);
    }

    #[test]
    fn empty_write_creates_nothing() {
        let (_dir, _config, mut store) = store_with(10);
        store.write(&[]).unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn items_come_back_in_write_order() {
        let (_dir, _config, mut store) = store_with(4);
        store.write(&items(0..3)).unwrap();
        store.write(&items(3..11)).unwrap();
        store.write(&items(11..12)).unwrap();
        assert_eq!(drain(&mut store), items(0..12));
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn chunk_sizes_follow_capacity() {
        let (_dir, _config, mut store) = store_with(10);
        store.write(&items(0..25)).unwrap();
        store.close().unwrap();

        let sizes: Vec<u64> = store
            .index()
            .records()
            .unwrap()
            .iter()
            .map(|r| r.size)
            .collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[test]
    fn exact_multiple_does_not_leave_empty_chunk() {
        let (_dir, _config, mut store) = store_with(5);
        store.write(&items(0..10)).unwrap();
        store.close().unwrap();
        assert_eq!(store.summary().unwrap().chunks, 2);
    }

    #[test]
    fn straddling_write_matches_split_write() {
        let (_dir_a, _config_a, mut one_call) = store_with(10);
        one_call.write(&items(0..15)).unwrap();
        one_call.close().unwrap();

        let (_dir_b, _config_b, mut two_calls) = store_with(10);
        two_calls.write(&items(0..10)).unwrap();
        two_calls.write(&items(10..15)).unwrap();
        two_calls.close().unwrap();

        let sizes = |store: &ChunkStore| -> Vec<u64> {
            store.index().records().unwrap().iter().map(|r| r.size).collect()
        };
        assert_eq!(sizes(&one_call), sizes(&two_calls));
        assert_eq!(drain(&mut one_call), drain(&mut two_calls));
    }

    #[test]
    fn files_match_index_after_writes_and_reads() {
        let (_dir, config, mut store) = store_with(3);
        store.write(&items(0..8)).unwrap();
        store.read().unwrap();
        store.write(&items(8..10)).unwrap();
        store.close().unwrap();

        let report = inspect(&config).unwrap();
        assert!(report.is_consistent(), "{report:?}");
        for record in &report.records {
            assert_eq!(line_count(&store.chunk_path(record.id)), record.size);
        }
    }

    #[test]
    fn reading_the_open_tail_closes_it_first() {
        let (_dir, _config, mut store) = store_with(100);
        store.write(&items(0..3)).unwrap();
        let tail = store.tail_id().unwrap();

        let read = store.read().unwrap();
        assert_eq!(read.items, items(0..3));
        assert_eq!(store.tail_id(), None);
        assert!(store.is_empty().unwrap());
        assert!(!store.chunk_path(tail).exists());

        store.write(&items(3..4)).unwrap();
        assert!(store.tail_id().unwrap() > tail);
    }

    #[test]
    fn missing_file_drops_record_and_continues() {
        let (_dir, _config, mut store) = store_with(5);
        store.write(&items(0..10)).unwrap();
        store.close().unwrap();

        let head = store.index().oldest().unwrap().unwrap().id;
        std::fs::remove_file(store.chunk_path(head)).unwrap();

        assert_eq!(
            store.load_oldest().unwrap(),
            LoadOutcome::Orphaned { id: head }
        );
        assert!(store.index().get(head).unwrap().is_none());

        let read = store.read().unwrap();
        assert_eq!(read.items, items(5..10));
    }

    #[test]
    fn orphan_read_reports_no_items_but_not_empty() {
        let (_dir, _config, mut store) = store_with(5);
        store.write(&items(0..2)).unwrap();
        store.close().unwrap();
        let head = store.index().oldest().unwrap().unwrap().id;
        std::fs::remove_file(store.chunk_path(head)).unwrap();

        let read = store.read().unwrap();
        assert!(!read.was_empty);
        assert!(read.items.is_empty());
        assert!(store.read().unwrap().was_empty);
    }

    #[test]
    fn reopen_reconciles_stale_tail_size() {
        let (_dir, config, mut store) = store_with(100);
        store.write(&items(0..4)).unwrap();
        let tail = store.tail_id().unwrap();
        assert_eq!(store.index().get(tail).unwrap().unwrap().size, 0);
        drop(store);

        let reopened = ChunkStore::open(&config).unwrap();
        assert_eq!(reopened.tail_id(), Some(tail));
        assert_eq!(reopened.index().get(tail).unwrap().unwrap().size, 4);
    }

    #[test]
    fn reopen_truncates_torn_tail_line() {
        let (_dir, config, mut store) = store_with(100);
        store.write(&items(0..2)).unwrap();
        store.close().unwrap();
        let tail = store.index().newest().unwrap().unwrap().id;
        let path = store.chunk_path(tail);
        drop(store);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"half-writ").unwrap();
        drop(file);

        let mut reopened = ChunkStore::open(&config).unwrap();
        reopened.write(&items(2..3)).unwrap();
        assert_eq!(drain(&mut reopened), items(0..3));
    }

    #[test]
    fn reopened_full_tail_rolls_over() {
        let (_dir, config, mut store) = store_with(3);
        store.write(&items(0..3)).unwrap();
        let tail = store.tail_id().unwrap();
        drop(store);

        let mut reopened = ChunkStore::open(&config).unwrap();
        reopened.write(&items(3..4)).unwrap();
        assert!(reopened.tail_id().unwrap() > tail);
        assert_eq!(drain(&mut reopened), items(0..4));
    }

    #[test]
    fn unterminated_line_in_head_is_dropped() {
        let (_dir, _config, mut store) = store_with(2);
        store.write(&items(0..4)).unwrap();
        store.close().unwrap();
        let head = store.index().oldest().unwrap().unwrap().id;
        std::fs::write(store.chunk_path(head), "a\nb\npartial").unwrap();

        let read = store.read().unwrap();
        assert_eq!(read.items, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn newline_items_are_rejected_before_writing() {
        let (_dir, _config, mut store) = store_with(10);
        let batch = vec![b"ok".to_vec(), b"bad\nitem".to_vec()];
        let err = store.write(&batch).unwrap_err();
        assert_eq!(err.written, 0);
        assert!(matches!(
            err.source,
            Error::Chunk(ChunkError::InvalidItem { position: 1 })
        ));
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn non_utf8_items_are_stored_verbatim() {
        let (_dir, config, mut store) = store_with(2);
        let batch = vec![b"\xff\xfe".to_vec(), vec![0x80, 0x00, b'\r'], Vec::new()];
        store.write(&batch).unwrap();
        store.close().unwrap();
        drop(store);

        let mut reopened = ChunkStore::open(&config).unwrap();
        assert_eq!(drain(&mut reopened), batch);
    }

    #[test]
    fn failed_rollover_reports_stored_prefix() {
        let (_dir, _config, mut store) = store_with(2);
        let blocker = store.chunk_path(2);
        std::fs::create_dir(&blocker).unwrap();

        let batch = items(0..5);
        let err = store.write(&batch).unwrap_err();
        assert_eq!(err.written, 2);
        assert!(matches!(err.source, Error::Chunk(ChunkError::Io { .. })));

        std::fs::remove_dir(&blocker).unwrap();
        store.write(&batch[err.written..]).unwrap();
        assert_eq!(drain(&mut store), batch);
    }

    #[test]
    fn failed_append_drops_stale_writer() {
        let (_dir, _config, mut store) = store_with(10);
        store.write(&items(0..2)).unwrap();
        let tail = store.tail_id().unwrap();
        let path = store.chunk_path(tail);

        // A read-only handle makes the next flush fail.
        let len = std::fs::metadata(&path).unwrap().len();
        store.writer = Some(ChunkWriter {
            id: tail,
            count: 2,
            len,
            path: path.clone(),
            file: BufWriter::new(File::open(&path).unwrap()),
        });

        let err = store.write(&items(2..4)).unwrap_err();
        assert_eq!(err.written, 0);
        assert_eq!(store.tail_id(), None);

        store.write(&items(2..4)).unwrap();
        assert_eq!(store.tail_id(), Some(tail));
        assert_eq!(line_count(&path), 4);
        assert_eq!(drain(&mut store), items(0..4));
    }

    #[test]
    fn discard_truncates_to_last_complete_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(chunk_file_name(1));
        std::fs::write(&path, "a\n").unwrap();
        let file = OpenOptions::new().append(true).open(&path).unwrap();

        let mut writer = ChunkWriter {
            id: 1,
            count: 1,
            len: 2,
            path: path.clone(),
            file: BufWriter::new(file),
        };
        writer.file.write_all(b"half").unwrap();
        writer.file.flush().unwrap();
        writer.file.write_all(b"buffered").unwrap();
        writer.discard();

        assert_eq!(std::fs::read(&path).unwrap(), b"a\n");
    }

    #[test]
    fn leased_chunk_is_not_appended_to() {
        let (_dir, _config, mut store) = store_with(100);
        store.write(&items(0..3)).unwrap();

        let LoadOutcome::Loaded(first) = store.load_oldest().unwrap() else {
            panic!("expected a loaded chunk");
        };
        store.write(&items(3..5)).unwrap();
        assert_ne!(store.tail_id(), Some(first.id));

        // Not retired yet, so the same chunk comes back.
        let LoadOutcome::Loaded(again) = store.load_oldest().unwrap() else {
            panic!("expected a loaded chunk");
        };
        assert_eq!(again, first);

        store.retire(first.id).unwrap();
        assert_eq!(drain(&mut store), items(3..5));
    }

    #[test]
    fn retire_twice_is_harmless() {
        let (_dir, _config, mut store) = store_with(10);
        store.write(&items(0..1)).unwrap();
        let LoadOutcome::Loaded(chunk) = store.load_oldest().unwrap() else {
            panic!("expected a loaded chunk");
        };
        store.retire(chunk.id).unwrap();
        store.retire(chunk.id).unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn inspect_reports_untracked_and_missing_files() {
        let (_dir, config, mut store) = store_with(2);
        store.write(&items(0..4)).unwrap();
        store.close().unwrap();
        let head = store.index().oldest().unwrap().unwrap().id;
        std::fs::remove_file(store.chunk_path(head)).unwrap();
        std::fs::write(config.data_dir.join(chunk_file_name(999)), "x\n").unwrap();
        std::fs::write(config.data_dir.join("notes.md"), "ignored").unwrap();

        let report = inspect(&config).unwrap();
        assert_eq!(report.summary.chunks, 2);
        assert_eq!(report.missing_files, vec![head]);
        assert_eq!(
            report.untracked_files,
            vec![config.data_dir.join(chunk_file_name(999))]
        );
        assert!(!report.is_consistent());
    }

    #[test]
    fn inspect_does_not_create_storage() {
        let dir = tempdir().unwrap();
        let config = ChunkStoreConfig {
            data_dir: dir.path().join("data"),
            index_file: dir.path().join("index.db"),
            data_chunk: 10,
        };
        let report = inspect(&config).unwrap();
        assert_eq!(report, StoreReport::default());
        assert!(!config.index_file.exists());
        assert!(!config.data_dir.exists());
    }
}
