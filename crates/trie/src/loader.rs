//! The streaming sub-trie loader.
//!
//! Walks the hashed-state bucket and the intermediate-hash bucket side by
//! side. A cached subtree hash whose path is not retained substitutes its
//! whole subtree and the walk skips the covered key range; a retained row is
//! reported to the hash collector as a deletion and the walk descends into
//! the live state beneath it. Even-length nibble paths are byte prefixes, so
//! all range math happens on packed keys.

use crate::{
    nibbles::unpack_nibbles, RetainList, SharedHashCollector, StreamItem, StreamReceiver,
    SubTries, TrieError,
};
use alloy_primitives::B256;
use stratus_kv::{tables, CancelToken, Cursor, Tx};
use stratus_primitives::{
    keys::{HASHED_STORAGE_KEY_LENGTH, HASH_LENGTH},
    Account,
};

/// First key after the subtree rooted at `key`: increment the last
/// non-`0xff` byte and drop everything after it.
fn next_subtree(key: &[u8]) -> Option<Vec<u8>> {
    for i in (0..key.len()).rev() {
        if key[i] != 0xff {
            let mut out = key[..=i].to_vec();
            out[i] += 1;
            return Some(out);
        }
    }
    None
}

/// Walks the subset of the trie implied by a retain list, streaming items to
/// a receiver and reporting invalidated cached hashes.
pub struct SubTrieLoader<'c> {
    retain: RetainList,
    hash_collector: Option<SharedHashCollector<'c>>,
    cancel: CancelToken,
}

impl std::fmt::Debug for SubTrieLoader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubTrieLoader")
            .field("retain", &self.retain)
            .field("has_hash_collector", &self.hash_collector.is_some())
            .finish()
    }
}

impl<'c> SubTrieLoader<'c> {
    /// A loader that re-walks subtrees covering keys in `retain`.
    pub fn new(retain: RetainList) -> Self {
        Self { retain, hash_collector: None, cancel: CancelToken::new() }
    }

    /// Reports deletions of invalidated cached hashes to `collector`.
    pub fn with_hash_collector(mut self, collector: SharedHashCollector<'c>) -> Self {
        self.hash_collector = Some(collector);
        self
    }

    /// Observes `cancel` at every suspension point.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the walk, folding the stream through `receiver`.
    pub fn load_sub_tries<'tx, T: Tx>(
        &mut self,
        tx: &'tx T,
        receiver: &mut dyn StreamReceiver,
    ) -> Result<SubTries, TrieError> {
        let mut ih = tx.cursor(tables::INTERMEDIATE_TRIE_HASH)?;
        let mut state = tx.cursor(tables::HASHED_STATE)?;

        let mut from: Vec<u8> = Vec::new();
        let mut ih_entry = self.seek_account_hash(&mut ih, &[])?;
        loop {
            self.cancel.check().map_err(TrieError::from)?;
            let upto = ih_entry.as_ref().map(|(key, _)| key.clone());
            self.stream_accounts(tx, &mut state, receiver, &from, upto.as_deref())?;
            match ih_entry {
                Some((path, hash)) => {
                    receiver.receive(StreamItem::AccountHash {
                        path: unpack_nibbles(&path),
                        hash,
                    })?;
                    match next_subtree(&path) {
                        Some(next) => {
                            from = next;
                            ih_entry = self.seek_account_hash(&mut ih, &from)?;
                        }
                        None => break,
                    }
                }
                None => break,
            }
        }
        receiver.receive(StreamItem::Cutoff)?;
        receiver.result()
    }

    /// Next usable cached account subtree at or after `start`. Retained rows
    /// passed over are reported as deletions; storage-level rows interleaved
    /// in the scan are deleted when their own path is retained.
    fn seek_account_hash<C: Cursor>(
        &mut self,
        cursor: &mut C,
        start: &[u8],
    ) -> Result<Option<(Vec<u8>, B256)>, TrieError> {
        let mut entry = cursor.seek(start)?;
        while let Some((key, value)) = entry {
            if key.len() > HASH_LENGTH {
                if self.retain.retains_storage_prefix(&key) {
                    self.emit_deletion(&key)?;
                }
            } else if self.retain.retains_account_prefix(&key) {
                self.emit_deletion(&key)?;
            } else {
                return Ok(Some((key, hash_row(&value)?)));
            }
            entry = cursor.next()?;
        }
        Ok(None)
    }

    /// Streams account leaves (and their storage subtries) with keys in
    /// `[from, upto)`.
    fn stream_accounts<'tx, T: Tx>(
        &mut self,
        tx: &'tx T,
        state: &mut T::Cursor<'tx>,
        receiver: &mut dyn StreamReceiver,
        from: &[u8],
        upto: Option<&[u8]>,
    ) -> Result<(), TrieError> {
        let mut entry = state.seek(from)?;
        while let Some((key, value)) = entry {
            self.cancel.check().map_err(TrieError::from)?;
            if upto.is_some_and(|bound| key.as_slice() >= bound) {
                return Ok(());
            }
            if key.len() != HASH_LENGTH {
                // stale storage row with no account record above it
                entry = state.next()?;
                continue;
            }
            let account = Account::decode_for_storage(&value)?;
            let mut storage_prefix = key.clone();
            storage_prefix.extend_from_slice(&account.incarnation.to_be_bytes());
            receiver.receive(StreamItem::Account { key, account })?;
            self.stream_storage(tx, receiver, &storage_prefix)?;
            entry = match next_subtree(&storage_prefix) {
                Some(next) => state.seek(&next)?,
                None => return Ok(()),
            };
        }
        Ok(())
    }

    /// Streams one account's storage, substituting cached storage subtree
    /// hashes where the retain list allows.
    fn stream_storage<'tx, T: Tx>(
        &mut self,
        tx: &'tx T,
        receiver: &mut dyn StreamReceiver,
        prefix: &[u8],
    ) -> Result<(), TrieError> {
        let mut ih = tx.cursor(tables::INTERMEDIATE_TRIE_HASH)?;
        let mut state = tx.cursor(tables::HASHED_STATE)?;

        let mut from = prefix.to_vec();
        let mut ih_entry = self.seek_storage_hash(&mut ih, prefix, &from)?;
        loop {
            self.cancel.check().map_err(TrieError::from)?;
            let upto = ih_entry.as_ref().map(|(key, _)| key.clone());

            let mut entry = state.seek(&from)?;
            while let Some((key, value)) = entry {
                if !key.starts_with(prefix) {
                    break;
                }
                if upto.as_ref().is_some_and(|bound| key >= *bound) {
                    break;
                }
                if key.len() == HASHED_STORAGE_KEY_LENGTH {
                    receiver.receive(StreamItem::Storage { key, value })?;
                }
                entry = state.next()?;
            }

            match ih_entry {
                Some((bucket_key, hash)) => {
                    receiver.receive(StreamItem::StorageHash {
                        key_prefix: prefix.to_vec(),
                        path: unpack_nibbles(&bucket_key[prefix.len()..]),
                        hash,
                    })?;
                    match next_subtree(&bucket_key) {
                        Some(next) if next.starts_with(prefix) => {
                            from = next;
                            ih_entry = self.seek_storage_hash(&mut ih, prefix, &from)?;
                        }
                        _ => break,
                    }
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Next usable cached storage subtree under `prefix` at or after `start`.
    fn seek_storage_hash<C: Cursor>(
        &mut self,
        cursor: &mut C,
        prefix: &[u8],
        start: &[u8],
    ) -> Result<Option<(Vec<u8>, B256)>, TrieError> {
        let mut entry = cursor.seek(start)?;
        while let Some((key, value)) = entry {
            if !key.starts_with(prefix) {
                return Ok(None);
            }
            if self.retain.retains_storage_prefix(&key) {
                self.emit_deletion(&key)?;
                entry = cursor.next()?;
                continue;
            }
            return Ok(Some((key, hash_row(&value)?)));
        }
        Ok(None)
    }

    fn emit_deletion(&mut self, bucket_key: &[u8]) -> Result<(), TrieError> {
        tracing::trace!(target: "trie::loader", key = ?bucket_key, "invalidating cached hash");
        if let Some(collector) = self.hash_collector {
            collector.lock().collect(&unpack_nibbles(bucket_key), None)?;
        }
        Ok(())
    }
}

fn hash_row(value: &[u8]) -> Result<B256, TrieError> {
    if value.len() != HASH_LENGTH {
        return Err(TrieError::CorruptHashRow { len: value.len() });
    }
    Ok(B256::from_slice(value))
}
