//! The collector: buffered, disk-spilling accumulation of key/value pairs and
//! their sorted load into a destination bucket.

use crate::{Buffer, BufferKind, EtlError};
use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    fmt,
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::Path,
};
use stratus_kv::{CancelToken, Kv, KvError, TxMut};
use tempfile::{NamedTempFile, TempDir};

/// Write batch size for loads, in bytes.
pub const DEFAULT_LOAD_BATCH_SIZE: usize = 32 * 1024 * 1024;

/// Object-safe write handle passed to load functions and commit callbacks.
///
/// Writes land in the same transaction as the engine's own batch, so resume
/// checkpoints and loaded rows are atomic with respect to each other.
pub trait Putter {
    /// Inserts or overwrites a key.
    fn put(&mut self, bucket: &'static str, key: &[u8], value: &[u8]) -> Result<(), KvError>;
    /// Removes a key.
    fn delete(&mut self, bucket: &'static str, key: &[u8]) -> Result<(), KvError>;
    /// Reads through the transaction, observing its pending writes.
    fn get(&self, bucket: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;
}

impl<T: TxMut> Putter for T {
    fn put(&mut self, bucket: &'static str, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        TxMut::put(self, bucket, key, value)
    }

    fn delete(&mut self, bucket: &'static str, key: &[u8]) -> Result<(), KvError> {
        TxMut::delete(self, bucket, key)
    }

    fn get(&self, bucket: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        stratus_kv::Tx::get(self, bucket, key)
    }
}

/// A load function: receives each merged pair and emits writes of its own.
pub type LoadFunc<'a> = Box<dyn FnMut(&mut dyn Putter, &[u8], &[u8]) -> Result<(), EtlError> + 'a>;

/// Commit-boundary callback: `(putter, last_key, is_done)`.
pub type OnLoadCommit<'a> =
    Box<dyn FnMut(&mut dyn Putter, &[u8], bool) -> Result<(), EtlError> + 'a>;

/// Knobs shared by [`transform`](crate::transform) and [`Collector::load`].
pub struct TransformArgs<'a> {
    /// Duplicate-key policy of the buffer.
    pub buffer_kind: BufferKind,
    /// Byte budget of the in-memory buffer before it spills.
    pub buffer_capacity: usize,
    /// First source key the extraction visits.
    pub extract_start_key: Option<Vec<u8>>,
    /// Merged keys strictly below this are skipped at load (resume).
    pub load_start_key: Option<Vec<u8>>,
    /// Invoked inside the batch transaction at every commit boundary.
    pub on_load_commit: Option<OnLoadCommit<'a>>,
    /// Cooperative cancellation signal.
    pub cancel: CancelToken,
    /// Byte budget of one load write batch.
    pub load_batch_size: usize,
}

impl Default for TransformArgs<'_> {
    fn default() -> Self {
        Self {
            buffer_kind: BufferKind::Sortable,
            buffer_capacity: crate::OPTIMAL_BUFFER_CAPACITY,
            extract_start_key: None,
            load_start_key: None,
            on_load_commit: None,
            cancel: CancelToken::new(),
            load_batch_size: DEFAULT_LOAD_BATCH_SIZE,
        }
    }
}

impl fmt::Debug for TransformArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformArgs")
            .field("buffer_kind", &self.buffer_kind)
            .field("buffer_capacity", &self.buffer_capacity)
            .field("extract_start_key", &self.extract_start_key)
            .field("load_start_key", &self.load_start_key)
            .field("has_on_load_commit", &self.on_load_commit.is_some())
            .field("load_batch_size", &self.load_batch_size)
            .finish()
    }
}

/// Accumulates pairs in a bounded buffer, spilling sorted runs to temp files,
/// and loads the k-way merge of all runs into a destination bucket.
///
/// The temp directory is removed when the collector is dropped, whether the
/// load completed, errored or was canceled; a crash leaves the files for the
/// operating system to reclaim.
#[derive(Debug)]
pub struct Collector {
    dir: TempDir,
    buffer: Box<dyn Buffer>,
    kind: BufferKind,
    files: Vec<EtlFile>,
    len: usize,
}

impl Collector {
    /// Creates a collector spilling under `tmpdir`.
    pub fn new(tmpdir: &Path, buffer: Box<dyn Buffer>) -> Result<Self, EtlError> {
        std::fs::create_dir_all(tmpdir)?;
        let kind = buffer.kind();
        Ok(Self { dir: TempDir::new_in(tmpdir)?, buffer, kind, files: Vec::new(), len: 0 })
    }

    /// Number of pairs collected so far (before duplicate combination).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Records one pair.
    pub fn collect(&mut self, key: &[u8], value: &[u8]) -> Result<(), EtlError> {
        self.buffer.put(key, value);
        self.len += 1;
        if self.buffer.is_full() {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<(), EtlError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let entries = self.buffer.drain_sorted();
        tracing::debug!(target: "etl", entries = entries.len(), spills = self.files.len() + 1, "flushing buffer to disk");
        self.files.push(EtlFile::new(self.dir.path(), entries)?);
        Ok(())
    }

    /// Merges all runs and loads them into `dst` in sorted key order.
    ///
    /// With no load function, each merged pair is written directly; an empty
    /// value deletes the key (tombstone). With a load function, the function
    /// owns all writes. Commit boundaries invoke `args.on_load_commit` inside
    /// the closing batch, once more with `is_done` after the final pair.
    pub fn load<K: Kv>(
        mut self,
        db: &K,
        dst: &'static str,
        mut load_fn: Option<LoadFunc<'_>>,
        mut args: TransformArgs<'_>,
    ) -> Result<(), EtlError> {
        self.spill()?;

        let mut heap: BinaryHeap<(Reverse<(Vec<u8>, usize)>, Vec<u8>)> = BinaryHeap::new();
        for (idx, file) in self.files.iter_mut().enumerate() {
            if let Some((key, value)) = file.read_next()? {
                heap.push((Reverse((key, idx)), value));
            }
        }

        let mut tx = db.begin_mut()?;
        let mut batch_bytes = 0usize;
        let mut last_key: Vec<u8> = Vec::new();

        while let Some((Reverse((key, idx)), mut value)) = heap.pop() {
            args.cancel.check().map_err(EtlError::from)?;
            if let Some((next_key, next_value)) = self.files[idx].read_next()? {
                heap.push((Reverse((next_key, idx)), next_value));
            }
            // combine duplicates across spills; pop order is chronological
            while let Some((Reverse((peek_key, _)), _)) = heap.peek() {
                if *peek_key != key {
                    break;
                }
                let (Reverse((_, dup_idx)), dup_value) =
                    heap.pop().expect("peeked entry is poppable");
                if let Some((next_key, next_value)) = self.files[dup_idx].read_next()? {
                    heap.push((Reverse((next_key, dup_idx)), next_value));
                }
                match self.kind {
                    BufferKind::Sortable => value = dup_value,
                    BufferKind::SortableAppend => value.extend_from_slice(&dup_value),
                    BufferKind::SortableOldestAppeared => {}
                }
            }

            if args.load_start_key.as_deref().is_some_and(|start| key.as_slice() < start) {
                continue;
            }

            match load_fn.as_mut() {
                Some(f) => f(&mut tx, &key, &value)?,
                None if value.is_empty() => TxMut::delete(&mut tx, dst, &key)?,
                None => TxMut::put(&mut tx, dst, &key, &value)?,
            }
            batch_bytes += key.len() + value.len();
            last_key = key;

            if batch_bytes >= args.load_batch_size {
                if let Some(on_commit) = args.on_load_commit.as_mut() {
                    on_commit(&mut tx, &last_key, false)?;
                }
                let batch = std::mem::replace(&mut tx, db.begin_mut()?);
                batch.commit()?;
                batch_bytes = 0;
            }
        }

        if let Some(on_commit) = args.on_load_commit.as_mut() {
            on_commit(&mut tx, &last_key, true)?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// One sorted spill file: `be8(klen) ++ be8(vlen) ++ key ++ value` frames.
#[derive(Debug)]
struct EtlFile {
    file: BufReader<NamedTempFile>,
    remaining: usize,
}

impl EtlFile {
    fn new(dir: &Path, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Self, EtlError> {
        let file = NamedTempFile::new_in(dir)?;
        let mut writer = BufWriter::new(file);
        for (key, value) in &entries {
            writer.write_all(&(key.len() as u64).to_be_bytes())?;
            writer.write_all(&(value.len() as u64).to_be_bytes())?;
            writer.write_all(key)?;
            writer.write_all(value)?;
        }
        let mut file = BufReader::new(writer.into_inner().map_err(|e| e.into_error())?);
        file.seek(SeekFrom::Start(0))?;
        Ok(Self { file, remaining: entries.len() })
    }

    fn read_next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, EtlError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let mut key_len = [0u8; 8];
        let mut value_len = [0u8; 8];
        self.file.read_exact(&mut key_len)?;
        self.file.read_exact(&mut value_len)?;
        let mut key = vec![0u8; u64::from_be_bytes(key_len) as usize];
        let mut value = vec![0u8; u64::from_be_bytes(value_len) as usize];
        self.file.read_exact(&mut key)?;
        self.file.read_exact(&mut value)?;
        self.remaining -= 1;
        Ok(Some((key, value)))
    }
}
