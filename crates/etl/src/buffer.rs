//! Bounded sortable buffers.
//!
//! All buffers are bounded in bytes and drain their contents sorted by key.
//! They differ only in how duplicate keys combine: last write wins,
//! concatenation, or first write wins. The collector applies the same policy
//! when merging spill files, so the combination is associative across spills.

use std::collections::BTreeMap;

/// Default buffer capacity for production collectors: 256 MiB.
pub const OPTIMAL_BUFFER_CAPACITY: usize = 256 * 1024 * 1024;

/// Duplicate-key policy of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// The last write for a key wins.
    Sortable,
    /// Values for equal keys are concatenated in write order.
    SortableAppend,
    /// The first write for a key wins.
    SortableOldestAppeared,
}

/// A bounded buffer of key/value pairs that drains in sorted order.
pub trait Buffer: std::fmt::Debug {
    /// Records a pair.
    fn put(&mut self, key: &[u8], value: &[u8]);
    /// Current byte size of buffered data.
    fn size(&self) -> usize;
    /// Whether the byte budget is exhausted.
    fn is_full(&self) -> bool;
    /// Whether nothing is buffered.
    fn is_empty(&self) -> bool;
    /// Removes and returns all pairs, sorted by key, duplicates combined.
    fn drain_sorted(&mut self) -> Vec<(Vec<u8>, Vec<u8>)>;
    /// The duplicate-key policy, applied again when merging spills.
    fn kind(&self) -> BufferKind;
}

/// Constructs a buffer of the given kind and byte capacity.
pub fn new_buffer(kind: BufferKind, capacity: usize) -> Box<dyn Buffer> {
    match kind {
        BufferKind::Sortable => Box::new(SortableBuffer::new(capacity)),
        BufferKind::SortableAppend => Box::new(SortableAppendBuffer::new(capacity)),
        BufferKind::SortableOldestAppeared => {
            Box::new(SortableOldestAppearedBuffer::new(capacity))
        }
    }
}

macro_rules! buffer_common {
    () => {
        fn size(&self) -> usize {
            self.size
        }

        fn is_full(&self) -> bool {
            self.size >= self.capacity
        }

        fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }

        fn drain_sorted(&mut self) -> Vec<(Vec<u8>, Vec<u8>)> {
            self.size = 0;
            std::mem::take(&mut self.entries).into_iter().collect()
        }
    };
}

/// Last write wins.
#[derive(Debug)]
pub struct SortableBuffer {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    size: usize,
    capacity: usize,
}

impl SortableBuffer {
    /// New buffer with the given byte capacity.
    pub fn new(capacity: usize) -> Self {
        Self { entries: BTreeMap::new(), size: 0, capacity }
    }
}

impl Buffer for SortableBuffer {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        match self.entries.insert(key.to_vec(), value.to_vec()) {
            Some(old) => self.size = (self.size + value.len()).saturating_sub(old.len()),
            None => self.size += key.len() + value.len(),
        }
    }

    fn kind(&self) -> BufferKind {
        BufferKind::Sortable
    }

    buffer_common!();
}

/// Values for equal keys are concatenated in write order.
#[derive(Debug)]
pub struct SortableAppendBuffer {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    size: usize,
    capacity: usize,
}

impl SortableAppendBuffer {
    /// New buffer with the given byte capacity.
    pub fn new(capacity: usize) -> Self {
        Self { entries: BTreeMap::new(), size: 0, capacity }
    }
}

impl Buffer for SortableAppendBuffer {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        match self.entries.get_mut(key) {
            Some(existing) => {
                existing.extend_from_slice(value);
                self.size += value.len();
            }
            None => {
                self.entries.insert(key.to_vec(), value.to_vec());
                self.size += key.len() + value.len();
            }
        }
    }

    fn kind(&self) -> BufferKind {
        BufferKind::SortableAppend
    }

    buffer_common!();
}

/// First write wins.
#[derive(Debug)]
pub struct SortableOldestAppearedBuffer {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    size: usize,
    capacity: usize,
}

impl SortableOldestAppearedBuffer {
    /// New buffer with the given byte capacity.
    pub fn new(capacity: usize) -> Self {
        Self { entries: BTreeMap::new(), size: 0, capacity }
    }
}

impl Buffer for SortableOldestAppearedBuffer {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        if !self.entries.contains_key(key) {
            self.size += key.len() + value.len();
            self.entries.insert(key.to_vec(), value.to_vec());
        }
    }

    fn kind(&self) -> BufferKind {
        BufferKind::SortableOldestAppeared
    }

    buffer_common!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sortable_keeps_last_write() {
        let mut buffer = SortableBuffer::new(1024);
        buffer.put(b"k", b"old");
        buffer.put(b"k", b"new");
        assert_eq!(buffer.drain_sorted(), vec![(b"k".to_vec(), b"new".to_vec())]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn append_concatenates() {
        let mut buffer = SortableAppendBuffer::new(1024);
        buffer.put(b"k", b"ab");
        buffer.put(b"k", b"cd");
        assert_eq!(buffer.drain_sorted(), vec![(b"k".to_vec(), b"abcd".to_vec())]);
    }

    #[test]
    fn oldest_appeared_keeps_first_write() {
        let mut buffer = SortableOldestAppearedBuffer::new(1024);
        buffer.put(b"k", b"first");
        buffer.put(b"k", b"second");
        assert_eq!(buffer.drain_sorted(), vec![(b"k".to_vec(), b"first".to_vec())]);
    }

    #[test]
    fn drains_in_key_order_and_reports_fullness() {
        let mut buffer = SortableBuffer::new(4);
        buffer.put(b"b", b"2");
        assert!(!buffer.is_full());
        buffer.put(b"a", b"1");
        assert!(buffer.is_full());
        assert_eq!(
            buffer.drain_sorted(),
            vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]
        );
    }
}
