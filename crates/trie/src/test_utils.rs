//! Fixture helpers for trie and stage tests.

use crate::{DefaultReceiver, StreamItem, StreamReceiver, TrieError};
use alloy_primitives::B256;
use std::collections::BTreeMap;
use stratus_kv::{tables, Kv, TxMut};
use stratus_primitives::{keys::STORAGE_PREFIX_LENGTH, Account};

/// In-memory hashed state: account key → record, storage key → value.
#[derive(Debug, Clone, Default)]
pub struct HashedState {
    /// 32-byte hashed account keys.
    pub accounts: BTreeMap<Vec<u8>, Account>,
    /// 72-byte hashed storage keys with trimmed values.
    pub storage: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl HashedState {
    /// Streams the state through a [`DefaultReceiver`] and returns the root.
    pub fn state_root(&self) -> Result<B256, TrieError> {
        let mut receiver = DefaultReceiver::new(None);
        for (key, account) in &self.accounts {
            receiver.receive(StreamItem::Account { key: key.clone(), account: *account })?;
            let mut prefix = key.clone();
            prefix.extend_from_slice(&account.incarnation.to_be_bytes());
            for (storage_key, value) in self.storage.range(prefix.clone()..) {
                if !storage_key.starts_with(&prefix) {
                    break;
                }
                receiver.receive(StreamItem::Storage {
                    key: storage_key.clone(),
                    value: value.clone(),
                })?;
            }
        }
        receiver.receive(StreamItem::Cutoff)?;
        Ok(receiver.result()?.hashes[0])
    }

    /// Writes the state into the hashed-state bucket.
    pub fn write_to<K: Kv>(&self, db: &K) -> Result<(), stratus_kv::KvError> {
        db.update(|tx| {
            for (key, account) in &self.accounts {
                TxMut::put(tx, tables::HASHED_STATE, key, &account.encode_for_storage())?;
            }
            for (key, value) in &self.storage {
                TxMut::put(tx, tables::HASHED_STATE, key, value)?;
            }
            Ok(())
        })
    }
}

/// Reference root computations backed by the `triehash` crate, independent of
/// the hash builder under test.
#[cfg(test)]
pub(crate) mod reference {
    use super::*;
    use alloy_primitives::keccak256;
    use stratus_primitives::TrieAccount;

    /// Keccak-256 hasher for `triehash`.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub(crate) struct KeccakHasher;

    impl hash_db::Hasher for KeccakHasher {
        type Out = B256;
        type StdHasher = plain_hasher::PlainHasher;
        const LENGTH: usize = 32;

        fn hash(x: &[u8]) -> Self::Out {
            keccak256(x)
        }
    }

    /// Root of raw `(key, value)` pairs.
    pub(crate) fn trie_root(data: &BTreeMap<Vec<u8>, Vec<u8>>) -> B256 {
        triehash::trie_root::<KeccakHasher, _, _, _>(data.iter())
    }

    /// Storage root from `(hashed slot, trimmed value)` pairs.
    pub(crate) fn storage_root(slots: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>) -> B256 {
        triehash::trie_root::<KeccakHasher, _, _, _>(
            slots.into_iter().map(|(slot, value)| (slot, alloy_rlp::encode(&value[..]))),
        )
    }

    /// State root of accounts with precomputed storage roots.
    pub(crate) fn state_root_with_roots(
        accounts: &BTreeMap<Vec<u8>, (Account, B256)>,
    ) -> B256 {
        triehash::trie_root::<KeccakHasher, _, _, _>(accounts.iter().map(
            |(key, (account, storage_root))| {
                (key.clone(), alloy_rlp::encode(TrieAccount::from((*account, *storage_root))))
            },
        ))
    }

    /// State root of accounts with no storage.
    pub(crate) fn state_root_no_storage(accounts: &BTreeMap<Vec<u8>, Account>) -> B256 {
        triehash::trie_root::<KeccakHasher, _, _, _>(accounts.iter().map(|(key, account)| {
            (key.clone(), alloy_rlp::encode(TrieAccount::from_account_no_storage(*account)))
        }))
    }

    /// Full reference state root of a [`HashedState`].
    pub(crate) fn state_root_of(state: &HashedState) -> B256 {
        let with_roots: BTreeMap<Vec<u8>, (Account, B256)> = state
            .accounts
            .iter()
            .map(|(key, account)| {
                let mut prefix = key.clone();
                prefix.extend_from_slice(&account.incarnation.to_be_bytes());
                let slots = state
                    .storage
                    .range(prefix.clone()..)
                    .take_while(|(k, _)| k.starts_with(&prefix))
                    .map(|(k, v)| (k[STORAGE_PREFIX_LENGTH..].to_vec(), v.clone()));
                let root = storage_root(slots);
                (key.clone(), (*account, root))
            })
            .collect();
        state_root_with_roots(&with_roots)
    }

    #[test]
    fn receiver_root_matches_reference_with_storage() {
        let mut state = HashedState::default();
        for i in 0u64..24 {
            let key = keccak256(i.to_be_bytes()).to_vec();
            let mut account = Account::new(i, alloy_primitives::U256::from(1_000 + i));
            account.incarnation = 1;
            if i % 3 == 0 {
                let mut prefix = key.clone();
                prefix.extend_from_slice(&1u64.to_be_bytes());
                for j in 0u64..8 {
                    let mut storage_key = prefix.clone();
                    storage_key.extend_from_slice(keccak256(j.to_be_bytes()).as_slice());
                    state.storage.insert(storage_key, vec![j as u8 + 1]);
                }
            }
            state.accounts.insert(key, account);
        }
        assert_eq!(state.state_root().unwrap(), state_root_of(&state));
    }
}
