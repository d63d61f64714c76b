//! The trie item stream and its default folding receiver.

use crate::{
    nibbles::unpack_nibbles, HashBuilder, Nibbles, TrieError,
};
use alloy_primitives::B256;
use stratus_primitives::{
    keys::{HASH_LENGTH, STORAGE_PREFIX_LENGTH},
    Account, TrieAccount, EMPTY_ROOT_HASH,
};

/// Sink for intermediate hashes produced (or invalidated) by a trie walk.
///
/// `hash` is `None` when a cached subtree hash became invalid and must be
/// tombstoned. Paths are full unpacked nibble paths; implementations persist
/// only even-length, non-empty ones.
pub trait HashCollector {
    /// Records one intermediate hash creation or deletion.
    fn collect(&mut self, path: &[u8], hash: Option<B256>) -> Result<(), TrieError>;
}

/// A hash collector shared between the loader (deletions) and the receiver's
/// hash builders (creations).
pub type SharedHashCollector<'a> = &'a parking_lot::Mutex<dyn HashCollector + 'a>;

/// One item of the trie stream, in walk order.
#[derive(Debug, Clone)]
pub enum StreamItem {
    /// An account leaf from the hashed state.
    Account {
        /// Hashed account key (32 bytes).
        key: Vec<u8>,
        /// Decoded account record.
        account: Account,
    },
    /// A storage leaf from the hashed state.
    Storage {
        /// Hashed storage key (72 bytes).
        key: Vec<u8>,
        /// Trimmed big-endian slot value.
        value: Vec<u8>,
    },
    /// A cached account subtree hash substituting its whole subtree.
    AccountHash {
        /// Unpacked nibble path of the subtree root.
        path: Vec<u8>,
        /// Cached subtree hash.
        hash: B256,
    },
    /// A cached storage subtree hash within one account's storage trie.
    StorageHash {
        /// `hashed address ++ incarnation` context (40 bytes).
        key_prefix: Vec<u8>,
        /// Unpacked nibble path within the storage trie.
        path: Vec<u8>,
        /// Cached subtree hash.
        hash: B256,
    },
    /// End of stream; flushes all pending state.
    Cutoff,
}

/// Subtree hashes produced by a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTries {
    /// One hash per requested range; a single root for the default range.
    pub hashes: Vec<B256>,
}

/// Consumer of the trie stream.
pub trait StreamReceiver {
    /// Folds one item.
    fn receive(&mut self, item: StreamItem) -> Result<(), TrieError>;

    /// Finishes the fold and returns the subtree hashes.
    fn result(&mut self) -> Result<SubTries, TrieError>;
}

struct PendingAccount<'c> {
    key: Vec<u8>,
    account: Account,
    storage_hb: Option<HashBuilder<'c>>,
    last_storage_key: Vec<u8>,
}

/// Folds the stream into the state root.
///
/// Account leaves are deferred until their storage substream completes, so
/// the leaf RLP can embed the freshly folded storage root. Branch hashes
/// formed along the way go to the shared collector, storage paths prefixed
/// with their account context.
pub struct DefaultReceiver<'c> {
    collector: Option<SharedHashCollector<'c>>,
    account_hb: HashBuilder<'c>,
    pending: Option<PendingAccount<'c>>,
    last_account_key: Vec<u8>,
    root: Option<B256>,
}

impl std::fmt::Debug for DefaultReceiver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultReceiver")
            .field("has_collector", &self.collector.is_some())
            .field("pending", &self.pending.as_ref().map(|p| &p.key))
            .field("root", &self.root)
            .finish()
    }
}

impl<'c> DefaultReceiver<'c> {
    /// A receiver reporting new branch hashes to `collector`.
    pub fn new(collector: Option<SharedHashCollector<'c>>) -> Self {
        let account_hb = match collector {
            Some(shared) => HashBuilder::with_branch_sink(move |path, hash| {
                shared.lock().collect(path, Some(hash))
            }),
            None => HashBuilder::new(),
        };
        Self {
            collector,
            account_hb,
            pending: None,
            last_account_key: Vec::new(),
            root: None,
        }
    }

    fn finish_pending(&mut self) -> Result<(), TrieError> {
        if let Some(mut pending) = self.pending.take() {
            let storage_root = match pending.storage_hb.as_mut() {
                Some(hb) => hb.root()?,
                None => EMPTY_ROOT_HASH,
            };
            let trie_account = TrieAccount::from((pending.account, storage_root));
            let payload = alloy_rlp::encode(trie_account);
            self.account_hb.add_leaf(Nibbles::unpack(&pending.key), &payload)?;
        }
        Ok(())
    }
}

fn storage_builder<'a, 'c>(
    collector: Option<SharedHashCollector<'c>>,
    pending: &'a mut PendingAccount<'c>,
    key_prefix: &[u8],
) -> &'a mut HashBuilder<'c> {
    if pending.storage_hb.is_none() {
        pending.storage_hb = Some(match collector {
            Some(shared) => {
                let prefix_nibbles = unpack_nibbles(key_prefix);
                HashBuilder::with_branch_sink(move |path, hash| {
                    let mut full = prefix_nibbles.clone();
                    full.extend_from_slice(path);
                    shared.lock().collect(&full, Some(hash))
                })
            }
            None => HashBuilder::new(),
        });
    }
    pending.storage_hb.as_mut().expect("storage builder just initialized")
}

impl StreamReceiver for DefaultReceiver<'_> {
    fn receive(&mut self, item: StreamItem) -> Result<(), TrieError> {
        match item {
            StreamItem::Account { key, account } => {
                if !self.last_account_key.is_empty() && key <= self.last_account_key {
                    return Err(TrieError::OutOfOrder);
                }
                self.finish_pending()?;
                self.last_account_key = key.clone();
                self.pending = Some(PendingAccount {
                    key,
                    account,
                    storage_hb: None,
                    last_storage_key: Vec::new(),
                });
            }
            StreamItem::AccountHash { path, hash } => {
                self.finish_pending()?;
                self.account_hb.add_branch(Nibbles::from_hex(path), hash)?;
            }
            StreamItem::Storage { key, value } => {
                let collector = self.collector;
                let pending = self.pending.as_mut().ok_or(TrieError::OrphanStorage)?;
                if !key.starts_with(&pending.key) {
                    return Err(TrieError::OrphanStorage);
                }
                if !pending.last_storage_key.is_empty() && key <= pending.last_storage_key {
                    return Err(TrieError::OutOfOrder);
                }
                let hb = storage_builder(collector, pending, &key[..STORAGE_PREFIX_LENGTH]);
                let payload = alloy_rlp::encode(&value[..]);
                hb.add_leaf(Nibbles::unpack(&key[STORAGE_PREFIX_LENGTH..]), &payload)?;
                pending.last_storage_key = key;
            }
            StreamItem::StorageHash { key_prefix, path, hash } => {
                let collector = self.collector;
                let pending = self.pending.as_mut().ok_or(TrieError::OrphanStorage)?;
                if !key_prefix.starts_with(&pending.key[..HASH_LENGTH.min(pending.key.len())]) {
                    return Err(TrieError::OrphanStorage);
                }
                let hb = storage_builder(collector, pending, &key_prefix);
                hb.add_branch(Nibbles::from_hex(path), hash)?;
            }
            StreamItem::Cutoff => {
                self.finish_pending()?;
                self.root = Some(self.account_hb.root()?);
            }
        }
        Ok(())
    }

    fn result(&mut self) -> Result<SubTries, TrieError> {
        let root = match self.root {
            Some(root) => root,
            None => self.account_hb.root()?,
        };
        Ok(SubTries { hashes: vec![root] })
    }
}
