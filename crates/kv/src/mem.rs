//! In-memory engine backing the [`Kv`] abstraction.
//!
//! Buckets are `BTreeMap`s behind a single `RwLock`. Write transactions
//! buffer puts and deletes in an overlay that is applied atomically on
//! commit; cursors merge the committed base with the transaction's overlay.
//! A background sweep task models the engine's value-log garbage collector:
//! started on open, signalled on close, joined before close returns.

use crate::{tables, CancelToken, Cursor, Kv, KvError, KvPair, Tx, TxMut};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    ops::Bound,
    sync::{mpsc, Arc},
    thread::JoinHandle,
    time::Duration,
};

type BucketMap = BTreeMap<Vec<u8>, Vec<u8>>;
type Overlay = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

#[derive(Debug, Default)]
struct Inner {
    buckets: RwLock<HashMap<&'static str, BucketMap>>,
}

impl Inner {
    fn ensure_bucket(&self, bucket: &'static str) -> Result<(), KvError> {
        if self.buckets.read().contains_key(bucket) {
            Ok(())
        } else {
            Err(KvError::BucketNotFound(bucket))
        }
    }
}

#[derive(Debug)]
struct GcTask {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// In-memory [`Kv`] engine.
#[derive(Debug)]
pub struct MemKv {
    inner: Arc<Inner>,
    gc: Mutex<Option<GcTask>>,
}

impl MemKv {
    /// Opens an engine with the full pipeline schema.
    pub fn new() -> Self {
        Self::with_buckets(tables::ALL)
    }

    /// Opens an engine with an explicit bucket set.
    pub fn with_buckets(buckets: &[&'static str]) -> Self {
        let mut map = HashMap::with_capacity(buckets.len());
        for name in buckets {
            map.insert(*name, BucketMap::new());
        }
        Self {
            inner: Arc::new(Inner { buckets: RwLock::new(map) }),
            gc: Mutex::new(None),
        }
    }

    /// Opens an engine with the full schema and a background GC sweep firing
    /// every `interval`.
    pub fn with_gc(interval: Duration) -> Self {
        let kv = Self::new();
        let inner = Arc::clone(&kv.inner);
        let (stop, ticker) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || loop {
            match ticker.recv_timeout(interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => sweep(&inner),
                // signalled or the engine is gone
                _ => return,
            }
        });
        *kv.gc.lock() = Some(GcTask { stop, handle });
        kv
    }

    /// Signals the GC task and joins it. Idempotent.
    pub fn close(&self) {
        if let Some(task) = self.gc.lock().take() {
            let _ = task.stop.send(());
            let _ = task.handle.join();
        }
    }

    /// Begins a read-only transaction whose cursors observe `cancel`.
    pub fn begin_with_cancel(&self, cancel: CancelToken) -> MemTx<'_> {
        MemTx { inner: &self.inner, cancel }
    }

    /// Begins a read-write transaction whose operations observe `cancel`.
    pub fn begin_mut_with_cancel(&self, cancel: CancelToken) -> MemTxMut<'_> {
        MemTxMut {
            inner: &self.inner,
            pending: HashMap::new(),
            cleared: HashSet::new(),
            cancel,
        }
    }
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemKv {
    fn drop(&mut self) {
        self.close();
    }
}

fn sweep(inner: &Inner) {
    let guard = inner.buckets.read();
    let mut entries = 0usize;
    let mut bytes = 0usize;
    for bucket in guard.values() {
        entries += bucket.len();
        bytes += bucket.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>();
    }
    tracing::debug!(target: "kv::gc", entries, bytes, "value log sweep");
}

impl Kv for MemKv {
    type Tx<'env>
        = MemTx<'env>
    where
        Self: 'env;
    type TxMut<'env>
        = MemTxMut<'env>
    where
        Self: 'env;

    fn begin(&self) -> Result<Self::Tx<'_>, KvError> {
        Ok(self.begin_with_cancel(CancelToken::new()))
    }

    fn begin_mut(&self) -> Result<Self::TxMut<'_>, KvError> {
        Ok(self.begin_mut_with_cancel(CancelToken::new()))
    }
}

/// Read-only transaction over [`MemKv`].
#[derive(Debug)]
pub struct MemTx<'env> {
    inner: &'env Inner,
    cancel: CancelToken,
}

impl Tx for MemTx<'_> {
    type Cursor<'tx>
        = MemCursor<'tx>
    where
        Self: 'tx;

    fn get(&self, bucket: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        self.cancel.check()?;
        let guard = self.inner.buckets.read();
        let map = guard.get(bucket).ok_or(KvError::BucketNotFound(bucket))?;
        Ok(map.get(key).cloned())
    }

    fn cursor(&self, bucket: &'static str) -> Result<Self::Cursor<'_>, KvError> {
        self.inner.ensure_bucket(bucket)?;
        Ok(MemCursor {
            inner: self.inner,
            bucket,
            overlay: None,
            hide_base: false,
            cancel: self.cancel.clone(),
            position: CursorPos::Unpositioned,
        })
    }
}

/// Read-write transaction over [`MemKv`].
#[derive(Debug)]
pub struct MemTxMut<'env> {
    inner: &'env Inner,
    pending: HashMap<&'static str, Overlay>,
    cleared: HashSet<&'static str>,
    cancel: CancelToken,
}

impl Tx for MemTxMut<'_> {
    type Cursor<'tx>
        = MemCursor<'tx>
    where
        Self: 'tx;

    fn get(&self, bucket: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        self.cancel.check()?;
        if let Some(overlay) = self.pending.get(bucket) {
            if let Some(slot) = overlay.get(key) {
                return Ok(slot.clone());
            }
        }
        if self.cleared.contains(bucket) {
            self.inner.ensure_bucket(bucket)?;
            return Ok(None);
        }
        let guard = self.inner.buckets.read();
        let map = guard.get(bucket).ok_or(KvError::BucketNotFound(bucket))?;
        Ok(map.get(key).cloned())
    }

    fn cursor(&self, bucket: &'static str) -> Result<Self::Cursor<'_>, KvError> {
        self.inner.ensure_bucket(bucket)?;
        Ok(MemCursor {
            inner: self.inner,
            bucket,
            overlay: self.pending.get(bucket),
            hide_base: self.cleared.contains(bucket),
            cancel: self.cancel.clone(),
            position: CursorPos::Unpositioned,
        })
    }
}

impl TxMut for MemTxMut<'_> {
    fn put(&mut self, bucket: &'static str, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.cancel.check()?;
        self.inner.ensure_bucket(bucket)?;
        self.pending
            .entry(bucket)
            .or_default()
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, bucket: &'static str, key: &[u8]) -> Result<(), KvError> {
        self.cancel.check()?;
        self.inner.ensure_bucket(bucket)?;
        self.pending.entry(bucket).or_default().insert(key.to_vec(), None);
        Ok(())
    }

    fn clear_bucket(&mut self, bucket: &'static str) -> Result<(), KvError> {
        self.cancel.check()?;
        self.inner.ensure_bucket(bucket)?;
        self.pending.remove(bucket);
        self.cleared.insert(bucket);
        Ok(())
    }

    fn commit(self) -> Result<(), KvError> {
        let mut guard = self.inner.buckets.write();
        for bucket in &self.cleared {
            if let Some(map) = guard.get_mut(bucket) {
                map.clear();
            }
        }
        for (bucket, overlay) in self.pending {
            let map = guard.get_mut(bucket).ok_or(KvError::BucketNotFound(bucket))?;
            for (key, slot) in overlay {
                match slot {
                    Some(value) => {
                        map.insert(key, value);
                    }
                    None => {
                        map.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn rollback(self) {}
}

#[derive(Debug)]
enum CursorPos {
    Unpositioned,
    At(Vec<u8>),
    Exhausted,
}

/// Cursor over one bucket, merging the committed base with the owning write
/// transaction's overlay (if any).
#[derive(Debug)]
pub struct MemCursor<'tx> {
    inner: &'tx Inner,
    bucket: &'static str,
    overlay: Option<&'tx Overlay>,
    hide_base: bool,
    cancel: CancelToken,
    position: CursorPos,
}

impl MemCursor<'_> {
    fn find_from(&mut self, from: &[u8], inclusive: bool) -> Result<Option<KvPair>, KvError> {
        self.cancel.check()?;
        let lower = if inclusive {
            Bound::Included(from.to_vec())
        } else {
            Bound::Excluded(from.to_vec())
        };
        let guard = self.inner.buckets.read();
        let base = guard.get(self.bucket).ok_or(KvError::BucketNotFound(self.bucket))?;

        let overlay = self.overlay;
        let base_entry = if self.hide_base {
            None
        } else {
            base.range((lower.clone(), Bound::Unbounded))
                .find(|(key, _)| overlay.map_or(true, |o| !o.contains_key(key.as_slice())))
                .map(|(key, value)| (key.clone(), value.clone()))
        };
        let overlay_entry = overlay.and_then(|o| {
            o.range((lower, Bound::Unbounded))
                .find_map(|(key, slot)| slot.as_ref().map(|value| (key.clone(), value.clone())))
        });

        let chosen = match (base_entry, overlay_entry) {
            (Some(base), Some(over)) => Some(if over.0 <= base.0 { over } else { base }),
            (base, over) => base.or(over),
        };
        self.position = match &chosen {
            Some((key, _)) => CursorPos::At(key.clone()),
            None => CursorPos::Exhausted,
        };
        Ok(chosen)
    }
}

impl Cursor for MemCursor<'_> {
    fn first(&mut self) -> Result<Option<KvPair>, KvError> {
        self.find_from(&[], true)
    }

    fn seek(&mut self, key: &[u8]) -> Result<Option<KvPair>, KvError> {
        self.find_from(key, true)
    }

    fn next(&mut self) -> Result<Option<KvPair>, KvError> {
        match std::mem::replace(&mut self.position, CursorPos::Unpositioned) {
            CursorPos::Unpositioned => self.first(),
            CursorPos::At(key) => self.find_from(&key, false),
            CursorPos::Exhausted => {
                self.position = CursorPos::Exhausted;
                Ok(None)
            }
        }
    }
}
