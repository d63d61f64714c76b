//! Chain fixture for stage tests: applies per-block state deltas to the
//! plain and hashed state buckets, records change-sets the way execution
//! does, and seals canonical headers whose roots come from an independent
//! fold of the hashed state.

use crate::{headers::write_canonical_header, progress::save_stage_progress, StageId};
use alloy_primitives::{keccak256, Address, B256};
use std::collections::BTreeMap;
use stratus_kv::{tables, Cursor, Kv, MemKv, MemTxMut, Tx, TxMut};
use stratus_primitives::{keys, Account, Header, EMPTY_ROOT_HASH};
use stratus_trie::test_utils::HashedState;

/// One state modification within a block.
#[derive(Debug, Clone)]
pub(crate) enum Change {
    PutAccount(Address, Account),
    DeleteAccount(Address),
    PutStorage(Address, u64, B256, Vec<u8>),
    DeleteStorage(Address, u64, B256),
}

/// A canonical chain over an in-memory database.
#[derive(Debug)]
pub(crate) struct ChainFixture {
    pub(crate) kv: MemKv,
    hashed: HashedState,
    plain_accounts: BTreeMap<Address, Account>,
    plain_storage: BTreeMap<Vec<u8>, Vec<u8>>,
    height: u64,
    last_hash: B256,
}

fn put_account(
    tx: &mut MemTxMut<'_>,
    hashed: &mut HashedState,
    plain_accounts: &mut BTreeMap<Address, Account>,
    number: u64,
    address: Address,
    account: Account,
) {
    let prior = plain_accounts
        .get(&address)
        .map(|account| account.encode_for_storage())
        .unwrap_or_default();
    TxMut::put(
        tx,
        tables::PLAIN_ACCOUNT_CHANGE_SET,
        &keys::change_set_key(number, address.as_slice()),
        &prior,
    )
    .unwrap();
    let encoded = account.encode_for_storage();
    plain_accounts.insert(address, account);
    TxMut::put(tx, tables::PLAIN_STATE, address.as_slice(), &encoded).unwrap();
    let hashed_key = keccak256(address.as_slice()).to_vec();
    hashed.accounts.insert(hashed_key.clone(), account);
    TxMut::put(tx, tables::HASHED_STATE, &hashed_key, &encoded).unwrap();
}

fn delete_account(
    tx: &mut MemTxMut<'_>,
    hashed: &mut HashedState,
    plain_accounts: &mut BTreeMap<Address, Account>,
    number: u64,
    address: Address,
) {
    let prior = plain_accounts
        .remove(&address)
        .map(|account| account.encode_for_storage())
        .unwrap_or_default();
    TxMut::put(
        tx,
        tables::PLAIN_ACCOUNT_CHANGE_SET,
        &keys::change_set_key(number, address.as_slice()),
        &prior,
    )
    .unwrap();
    TxMut::delete(tx, tables::PLAIN_STATE, address.as_slice()).unwrap();
    let hashed_key = keccak256(address.as_slice()).to_vec();
    hashed.accounts.remove(&hashed_key);
    TxMut::delete(tx, tables::HASHED_STATE, &hashed_key).unwrap();
}

fn put_storage(
    tx: &mut MemTxMut<'_>,
    hashed: &mut HashedState,
    plain_storage: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    number: u64,
    plain_key: Vec<u8>,
    value: Vec<u8>,
) {
    let prior = plain_storage.get(&plain_key).cloned().unwrap_or_default();
    TxMut::put(
        tx,
        tables::PLAIN_STORAGE_CHANGE_SET,
        &keys::change_set_key(number, &plain_key),
        &prior,
    )
    .unwrap();
    plain_storage.insert(plain_key.clone(), value.clone());
    TxMut::put(tx, tables::PLAIN_STATE, &plain_key, &value).unwrap();
    let hashed_key = keys::hash_plain_key(&plain_key).unwrap();
    hashed.storage.insert(hashed_key.clone(), value.clone());
    TxMut::put(tx, tables::HASHED_STATE, &hashed_key, &value).unwrap();
}

fn delete_storage_key(
    tx: &mut MemTxMut<'_>,
    hashed: &mut HashedState,
    plain_storage: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    number: u64,
    plain_key: &[u8],
) {
    let prior = plain_storage.remove(plain_key).unwrap_or_default();
    TxMut::put(
        tx,
        tables::PLAIN_STORAGE_CHANGE_SET,
        &keys::change_set_key(number, plain_key),
        &prior,
    )
    .unwrap();
    TxMut::delete(tx, tables::PLAIN_STATE, plain_key).unwrap();
    let hashed_key = keys::hash_plain_key(plain_key).unwrap();
    hashed.storage.remove(&hashed_key);
    TxMut::delete(tx, tables::HASHED_STATE, &hashed_key).unwrap();
}

impl ChainFixture {
    /// A chain with an empty genesis state at height 0.
    pub(crate) fn new() -> Self {
        let kv = MemKv::new();
        let genesis = Header {
            parent_hash: B256::ZERO,
            number: 0,
            state_root: EMPTY_ROOT_HASH,
            timestamp: 1_700_000_000,
        };
        let mut tx = kv.begin_mut().unwrap();
        write_canonical_header(&mut tx, &genesis).unwrap();
        TxMut::commit(tx).unwrap();
        Self {
            kv,
            hashed: HashedState::default(),
            plain_accounts: BTreeMap::new(),
            plain_storage: BTreeMap::new(),
            height: 0,
            last_hash: genesis.hash(),
        }
    }

    /// Applies `changes` as the next block, sealing a header whose state
    /// root reflects the resulting hashed state, and advancing Execution.
    pub(crate) fn apply_block(&mut self, changes: Vec<Change>) -> u64 {
        self.height += 1;
        let number = self.height;
        let Self { kv, hashed, plain_accounts, plain_storage, last_hash, .. } = self;

        let mut tx = kv.begin_mut().unwrap();
        for change in changes {
            match change {
                Change::PutAccount(address, account) => {
                    put_account(&mut tx, hashed, plain_accounts, number, address, account);
                }
                Change::DeleteAccount(address) => {
                    // execution clears the contract's storage alongside the
                    // account, one change-set row per slot
                    let slots: Vec<Vec<u8>> = plain_storage
                        .range(address.as_slice().to_vec()..)
                        .take_while(|(key, _)| key.starts_with(address.as_slice()))
                        .map(|(key, _)| key.clone())
                        .collect();
                    for plain_key in slots {
                        delete_storage_key(&mut tx, hashed, plain_storage, number, &plain_key);
                    }
                    delete_account(&mut tx, hashed, plain_accounts, number, address);
                }
                Change::PutStorage(address, incarnation, slot, value) => {
                    let plain_key = keys::plain_storage_key(address, incarnation, slot);
                    put_storage(&mut tx, hashed, plain_storage, number, plain_key, value);
                }
                Change::DeleteStorage(address, incarnation, slot) => {
                    let plain_key = keys::plain_storage_key(address, incarnation, slot);
                    delete_storage_key(&mut tx, hashed, plain_storage, number, &plain_key);
                }
            }
        }

        let state_root = hashed.state_root().unwrap();
        let header = Header {
            parent_hash: *last_hash,
            number,
            state_root,
            timestamp: 1_700_000_000 + number,
        };
        write_canonical_header(&mut tx, &header).unwrap();
        save_stage_progress(&mut tx, StageId::Execution, number, &[]).unwrap();
        TxMut::commit(tx).unwrap();
        *last_hash = header.hash();
        number
    }

    /// Rewinds plain and hashed state to height `h` by reverse-applying the
    /// recorded change-sets, moving Execution back. The change-set rows of
    /// the abandoned blocks stay behind, exactly as an execution unwind
    /// leaves them until re-execution overwrites the heights.
    pub(crate) fn revert_to(&mut self, h: u64) {
        let reverted = self.collect_changes_above(h);
        let Self { kv, hashed, plain_accounts, plain_storage, last_hash, height } = self;

        let mut tx = kv.begin_mut().unwrap();
        for (_, plain_key, prior, storage) in reverted.into_iter().rev() {
            if storage {
                let hashed_key = keys::hash_plain_key(&plain_key).unwrap();
                if prior.is_empty() {
                    plain_storage.remove(&plain_key);
                    hashed.storage.remove(&hashed_key);
                    TxMut::delete(&mut tx, tables::PLAIN_STATE, &plain_key).unwrap();
                    TxMut::delete(&mut tx, tables::HASHED_STATE, &hashed_key).unwrap();
                } else {
                    plain_storage.insert(plain_key.clone(), prior.clone());
                    hashed.storage.insert(hashed_key.clone(), prior.clone());
                    TxMut::put(&mut tx, tables::PLAIN_STATE, &plain_key, &prior).unwrap();
                    TxMut::put(&mut tx, tables::HASHED_STATE, &hashed_key, &prior).unwrap();
                }
            } else {
                let address = Address::from_slice(&plain_key);
                let hashed_key = keccak256(&plain_key).to_vec();
                if prior.is_empty() {
                    plain_accounts.remove(&address);
                    hashed.accounts.remove(&hashed_key);
                    TxMut::delete(&mut tx, tables::PLAIN_STATE, &plain_key).unwrap();
                    TxMut::delete(&mut tx, tables::HASHED_STATE, &hashed_key).unwrap();
                } else {
                    let account = Account::decode_for_storage(&prior).unwrap();
                    plain_accounts.insert(address, account);
                    hashed.accounts.insert(hashed_key.clone(), account);
                    TxMut::put(&mut tx, tables::PLAIN_STATE, &plain_key, &prior).unwrap();
                    TxMut::put(&mut tx, tables::HASHED_STATE, &hashed_key, &prior).unwrap();
                }
            }
        }
        save_stage_progress(&mut tx, StageId::Execution, h, &[]).unwrap();
        TxMut::commit(tx).unwrap();

        *height = h;
        let tx = kv.begin().unwrap();
        *last_hash = crate::headers::read_canonical_hash(&tx, h).unwrap().unwrap();
    }

    /// `(block, plain_key, prior, is_storage)` for every change above `h`,
    /// in ascending block order.
    fn collect_changes_above(&self, h: u64) -> Vec<(u64, Vec<u8>, Vec<u8>, bool)> {
        let tx = self.kv.begin().unwrap();
        let mut out = Vec::new();
        for (bucket, storage) in [
            (tables::PLAIN_ACCOUNT_CHANGE_SET, false),
            (tables::PLAIN_STORAGE_CHANGE_SET, true),
        ] {
            let start = keys::encode_block_number(h + 1);
            let mut cursor = tx.cursor(bucket).unwrap();
            cursor
                .walk(Some(start.as_slice()), |key, value| {
                    let block = keys::decode_block_number(key).unwrap();
                    out.push((block, key[8..].to_vec(), value.to_vec(), storage));
                    Ok(true)
                })
                .unwrap();
        }
        out.sort_by_key(|(block, ..)| *block);
        out
    }
}
