//! The intermediate-hashes stage.
//!
//! Keeps the `IntermediateTrieHash` bucket and the state trie root in step
//! with the Execution stage. On first run the whole trie is regenerated from
//! the hashed state; afterwards only the paths touched since the last run
//! are re-walked: change-sets are absorbed into per-key maps via ETL
//! (promoting the hashed state along the way), then the trie walk merges
//! those pending changes with the live stream and re-folds the dirty
//! subtrees, verifying the root against the canonical header.

use crate::{
    headers::read_canonical_state_root, Stage, StageError, StageId, StageState, UnwindState,
};
use alloy_primitives::B256;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use stratus_etl::{
    new_buffer, next_key, transform, BufferKind, Collector, EtlError, ExtractFunc, LoadFunc,
    OnLoadCommit, TransformArgs, OPTIMAL_BUFFER_CAPACITY,
};
use stratus_kv::{tables, CancelToken, Kv};
use stratus_primitives::{keys, Account};
use stratus_trie::{
    pack_nibbles, DefaultReceiver, HashCollector, RetainList, SharedHashCollector, StreamItem,
    StreamReceiver, SubTrieLoader, SubTries, TrieError,
};
use tracing::{info, warn};

const TARGET: &str = "sync::stages::intermediate_hashes";

/// Resume tag of the account change-set phase.
const ACCOUNT_PHASE: u8 = 0x01;
/// Resume tag of the storage change-set phase.
const STORAGE_PHASE: u8 = 0x02;

/// Builds the stage record for pipeline registration.
pub fn intermediate_hashes_stage<K: Kv>(tmpdir: PathBuf, cancel: CancelToken) -> Stage<K> {
    let exec_cancel = cancel.clone();
    Stage::new(
        StageId::IntermediateHashes,
        "Generating intermediate hashes",
        Box::new(move |s: &mut StageState, db: &K| {
            spawn_intermediate_hashes_stage(s, db, &tmpdir, &exec_cancel)
        }),
    )
    .with_unwind(Box::new(|u: &UnwindState, s: &mut StageState, db: &K| {
        unwind_intermediate_hashes_stage(u, s, db)
    }))
}

/// Stage entry point.
pub fn spawn_intermediate_hashes_stage<K: Kv>(
    s: &mut StageState,
    db: &K,
    tmpdir: &Path,
    cancel: &CancelToken,
) -> Result<(), StageError> {
    let sync_head = s.execution_at(db)?;
    if s.block_number == sync_head {
        // the hash check for this block already happened; equality instead
        // of `>` keeps reorgs from tripping the comparison
        s.done(db)?;
        return Ok(());
    }
    info!(target: TARGET, from = s.block_number, to = sync_head, "Generating intermediate hashes");

    let expected_root = {
        let tx = db.begin()?;
        read_canonical_state_root(&tx, sync_head)?
    };
    if s.block_number == 0 {
        regenerate_intermediate_hashes(db, tmpdir, expected_root, cancel)?;
    } else {
        increment_intermediate_hashes(s, db, s.block_number, tmpdir, expected_root, cancel)?;
    }
    s.done_and_update(db, sync_head)
}

/// Unwind only resets the resume state; the actual hash correction happens
/// on the next execution, which observes the lowered Execution height and
/// re-derives from the change-sets that accumulated across the reorg.
pub fn unwind_intermediate_hashes_stage<K: Kv>(
    u: &UnwindState,
    s: &mut StageState,
    db: &K,
) -> Result<(), StageError> {
    s.stage_data.clear();
    u.done(db)
}

/// Bridges the trie hash collector onto an ETL collector: even-length,
/// non-empty nibble paths are packed into bucket keys; deletions become
/// empty values, applied as tombstones at load.
struct TrieHashCollector {
    collector: Collector,
}

impl HashCollector for TrieHashCollector {
    fn collect(&mut self, path: &[u8], hash: Option<B256>) -> Result<(), TrieError> {
        if path.is_empty() || path.len() % 2 != 0 {
            return Ok(());
        }
        let key = pack_nibbles(path);
        match hash {
            Some(hash) => self.collector.collect(&key, hash.as_slice()),
            None => self.collector.collect(&key, &[]),
        }
        .map_err(|err| TrieError::Collector(Box::new(err)))
    }
}

fn verify_root(sub_tries: &SubTries, expected: B256) -> Result<(), StageError> {
    let got = sub_tries.hashes[0];
    if got != expected {
        warn!(target: TARGET, %got, %expected, "State root verification failed");
        return Err(StageError::WrongTrieRoot { got, expected });
    }
    info!(target: TARGET, root = %got, "Collection finished");
    Ok(())
}

fn regenerate_intermediate_hashes<K: Kv>(
    db: &K,
    tmpdir: &Path,
    expected_root: B256,
    cancel: &CancelToken,
) -> Result<(), StageError> {
    let collector =
        Collector::new(tmpdir, new_buffer(BufferKind::Sortable, OPTIMAL_BUFFER_CAPACITY))?;
    let sink = Mutex::new(TrieHashCollector { collector });
    let shared: SharedHashCollector<'_> = &sink;

    let mut receiver = DefaultReceiver::new(Some(shared));
    let mut loader = SubTrieLoader::new(RetainList::new())
        .with_hash_collector(shared)
        .with_cancel(cancel.clone());
    let sub_tries = {
        let tx = db.begin()?;
        loader.load_sub_tries(&tx, &mut receiver)?
    };
    verify_root(&sub_tries, expected_root)?;

    drop(loader);
    drop(receiver);
    let TrieHashCollector { collector } = sink.into_inner();
    collector.load(
        db,
        tables::INTERMEDIATE_TRIE_HASH,
        None,
        TransformArgs { cancel: cancel.clone(), ..Default::default() },
    )?;
    info!(target: TARGET, "Regeneration ended");
    Ok(())
}

/// Pending modifications gathered from the change-sets, keyed by hashed key.
/// `None` marks a key that no longer exists in plain state.
#[derive(Debug, Default)]
struct ChangedState {
    account_map: HashMap<Vec<u8>, Option<Account>>,
    storage_map: HashMap<Vec<u8>, Option<Vec<u8>>>,
    unfurl_list: Vec<Vec<u8>>,
}

/// How a change-set phase starts, decided from the persisted resume data.
#[derive(Debug, Default, Clone)]
struct PhasePlan {
    skip: bool,
    load_start_key: Option<Vec<u8>>,
    resume_floor: Option<Vec<u8>>,
}

fn phase_plan(stage_data: &[u8], tag: u8) -> Result<PhasePlan, StageError> {
    if stage_data.is_empty() {
        return Ok(PhasePlan::default());
    }
    let recorded = stage_data[0];
    if recorded > tag || (recorded == tag && stage_data.len() == 1) {
        // this phase (or a later one) already completed
        return Ok(PhasePlan { skip: true, ..Default::default() });
    }
    if recorded == tag {
        let checkpoint = stage_data[1..].to_vec();
        return Ok(PhasePlan {
            skip: false,
            load_start_key: Some(next_key(&checkpoint)?),
            resume_floor: Some(checkpoint),
        });
    }
    Ok(PhasePlan::default())
}

/// Phase A: turn one change-set bucket into pending modifications.
///
/// The ETL extract emits `(hashed key, plain key)` so the merged stream is
/// in trie key order and multi-block touches collapse to a single load; the
/// load re-reads the *current* value from plain state, records it in the
/// receiver maps and promotes it into the hashed-state bucket. Commit
/// boundaries checkpoint `[tag] ++ last key` through the same transaction.
#[allow(clippy::too_many_arguments)]
fn absorb_change_sets<K: Kv>(
    s: &StageState,
    db: &K,
    from: u64,
    storage: bool,
    tag: u8,
    changes: &mut ChangedState,
    tmpdir: &Path,
    cancel: &CancelToken,
) -> Result<PhasePlan, StageError> {
    let plan = phase_plan(&s.stage_data, tag)?;
    if plan.skip {
        return Ok(plan);
    }
    let change_set_bucket = if storage {
        tables::PLAIN_STORAGE_CHANGE_SET
    } else {
        tables::PLAIN_ACCOUNT_CHANGE_SET
    };
    info!(target: TARGET, from, bucket = change_set_bucket, "Incremental update of intermediate hashes");

    let extract: ExtractFunc<'_> = Box::new(|key, _prior, collector| {
        // we only care which keys changed; values are re-read from the
        // current plain state, not from the pre-images
        let plain_key = &key[8..];
        let hashed = keys::hash_plain_key(plain_key)
            .map_err(|err| EtlError::User(Box::new(err)))?;
        collector.collect(&hashed, plain_key)
    });

    let ChangedState { account_map, storage_map, unfurl_list } = changes;
    let load: LoadFunc<'_> = Box::new(move |putter, hashed_key, merged| {
        let plain_len = if hashed_key.len() == keys::HASH_LENGTH {
            keys::ADDRESS_LENGTH
        } else {
            keys::PLAIN_STORAGE_KEY_LENGTH
        };
        let plain_key = &merged[..plain_len];
        let current = putter.get(tables::PLAIN_STATE, plain_key)?;
        if storage {
            match current {
                Some(value) if !value.is_empty() => {
                    storage_map.insert(hashed_key.to_vec(), Some(value.clone()));
                    putter.put(tables::HASHED_STATE, hashed_key, &value)?;
                }
                _ => {
                    storage_map.insert(hashed_key.to_vec(), None);
                    putter.delete(tables::HASHED_STATE, hashed_key)?;
                }
            }
        } else {
            match current {
                Some(value) if !value.is_empty() => {
                    let account = Account::decode_for_storage(&value)
                        .map_err(|err| EtlError::User(Box::new(err)))?;
                    account_map.insert(hashed_key.to_vec(), Some(account));
                    putter.put(tables::HASHED_STATE, hashed_key, &value)?;
                }
                _ => {
                    account_map.insert(hashed_key.to_vec(), None);
                    putter.delete(tables::HASHED_STATE, hashed_key)?;
                }
            }
        }
        unfurl_list.push(hashed_key.to_vec());
        Ok(())
    });

    let on_commit: OnLoadCommit<'_> = Box::new(move |putter, key, is_done| {
        let mut data = vec![tag];
        if !is_done {
            data.extend_from_slice(key);
        }
        s.update_with_stage_data(putter, from, &data)?;
        Ok(())
    });

    transform(
        db,
        change_set_bucket,
        tables::HASHED_STATE,
        tmpdir,
        extract,
        Some(load),
        TransformArgs {
            buffer_kind: BufferKind::SortableAppend,
            extract_start_key: Some(keys::encode_block_number(from + 1).to_vec()),
            load_start_key: plan.load_start_key.clone(),
            on_load_commit: Some(on_commit),
            cancel: cancel.clone(),
            ..Default::default()
        },
    )?;
    Ok(plan)
}

/// Merges pending changes from the unfurl list with the live trie stream.
///
/// Both sides arrive in the same key order; a pending key equal to the live
/// key supersedes it (a `None` value deletes the leaf), and cutoff flushes
/// every remaining pending change.
struct InterleavingReceiver<'c> {
    inner: DefaultReceiver<'c>,
    changes: ChangedState,
    idx: usize,
}

impl<'c> InterleavingReceiver<'c> {
    fn new(inner: DefaultReceiver<'c>, mut changes: ChangedState) -> Self {
        changes.unfurl_list.sort_unstable();
        changes.unfurl_list.dedup();
        Self { inner, changes, idx: 0 }
    }

    fn emit_pending(&mut self, key: &[u8]) -> Result<(), TrieError> {
        if key.len() == keys::HASH_LENGTH {
            if let Some(Some(account)) = self.changes.account_map.get(key) {
                self.inner.receive(StreamItem::Account { key: key.to_vec(), account: *account })?;
            }
        } else if let Some(Some(value)) = self.changes.storage_map.get(key) {
            self.inner
                .receive(StreamItem::Storage { key: key.to_vec(), value: value.clone() })?;
        }
        Ok(())
    }
}

/// The position of an item in walk order; hash items sort at the start of
/// the subtree they cover. `None` (cutoff) compares below every key.
fn item_sort_key(item: &StreamItem) -> Option<Vec<u8>> {
    match item {
        StreamItem::Account { key, .. } | StreamItem::Storage { key, .. } => Some(key.clone()),
        StreamItem::AccountHash { path, .. } => Some(pack_nibbles(path)),
        StreamItem::StorageHash { key_prefix, path, .. } => {
            let mut key = key_prefix.clone();
            key.extend_from_slice(&pack_nibbles(path));
            Some(key)
        }
        StreamItem::Cutoff => None,
    }
}

impl StreamReceiver for InterleavingReceiver<'_> {
    fn receive(&mut self, item: StreamItem) -> Result<(), TrieError> {
        let item_key = item_sort_key(&item);
        while self.idx < self.changes.unfurl_list.len() {
            let pending = self.changes.unfurl_list[self.idx].clone();
            let supersedes = match &item_key {
                Some(key) => {
                    if pending.as_slice() > key.as_slice() {
                        break;
                    }
                    pending.as_slice() == key.as_slice()
                }
                None => false,
            };
            self.emit_pending(&pending)?;
            self.idx += 1;
            if supersedes {
                // the pending value replaces the live item
                return Ok(());
            }
        }
        self.inner.receive(item)
    }

    fn result(&mut self) -> Result<SubTries, TrieError> {
        self.inner.result()
    }
}

fn increment_intermediate_hashes<K: Kv>(
    s: &StageState,
    db: &K,
    from: u64,
    tmpdir: &Path,
    expected_root: B256,
    cancel: &CancelToken,
) -> Result<(), StageError> {
    let mut changes = ChangedState::default();
    let account_plan =
        absorb_change_sets(s, db, from, false, ACCOUNT_PHASE, &mut changes, tmpdir, cancel)?;
    let storage_plan =
        absorb_change_sets(s, db, from, true, STORAGE_PHASE, &mut changes, tmpdir, cancel)?;

    let mut retain = RetainList::new();
    for key in &changes.unfurl_list {
        retain.add_key(key);
    }
    // a skipped or resumed phase lost the per-key changes for its already
    // flushed prefix with the process; re-walk that whole prefix so no stale
    // cached hash survives a crash
    if account_plan.skip {
        retain.retain_all_accounts();
    } else if let Some(floor) = &account_plan.resume_floor {
        retain.retain_accounts_below(floor);
    }
    if storage_plan.skip {
        retain.retain_all_storage();
    } else if let Some(floor) = &storage_plan.resume_floor {
        retain.retain_storage_below(floor);
    }

    let collector =
        Collector::new(tmpdir, new_buffer(BufferKind::Sortable, OPTIMAL_BUFFER_CAPACITY))?;
    let sink = Mutex::new(TrieHashCollector { collector });
    let shared: SharedHashCollector<'_> = &sink;

    // the loader reports invalidated rows, the receiver's builders report
    // re-created ones; both flow into the same collector
    let mut receiver = InterleavingReceiver::new(DefaultReceiver::new(Some(shared)), changes);
    let mut loader = SubTrieLoader::new(retain)
        .with_hash_collector(shared)
        .with_cancel(cancel.clone());
    let sub_tries = {
        let tx = db.begin()?;
        loader.load_sub_tries(&tx, &mut receiver)?
    };
    verify_root(&sub_tries, expected_root)?;

    drop(loader);
    drop(receiver);
    let TrieHashCollector { collector } = sink.into_inner();
    collector.load(
        db,
        tables::INTERMEDIATE_TRIE_HASH,
        None,
        TransformArgs { cancel: cancel.clone(), ..Default::default() },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        progress::save_stage_progress,
        test_utils::{ChainFixture, Change},
    };
    use alloy_primitives::{Address, U256};
    use std::collections::BTreeMap;
    use stratus_kv::{Cursor, MemKv, Tx, TxMut};

    fn address(n: u64) -> Address {
        Address::from_slice(&alloy_primitives::keccak256(n.to_be_bytes())[..20])
    }

    fn run_stage(kv: &MemKv) -> Result<StageState, StageError> {
        let mut s = StageState::load(kv, StageId::IntermediateHashes)?;
        spawn_intermediate_hashes_stage(&mut s, kv, &std::env::temp_dir(), &CancelToken::new())?;
        Ok(s)
    }

    fn ih_bucket(kv: &MemKv) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let tx = kv.begin().unwrap();
        let mut out = BTreeMap::new();
        tx.cursor(tables::INTERMEDIATE_TRIE_HASH)
            .unwrap()
            .walk(None, |k, v| {
                out.insert(k.to_vec(), v.to_vec());
                Ok(true)
            })
            .unwrap();
        out
    }

    fn block_one() -> Vec<Change> {
        let mut changes = Vec::new();
        for i in 0u64..80 {
            changes.push(Change::PutAccount(address(i), Account::new(i, U256::from(1000 + i))));
            if i % 4 == 0 {
                for j in 0u64..12 {
                    changes.push(Change::PutStorage(
                        address(i),
                        1,
                        alloy_primitives::keccak256(j.to_be_bytes()).into(),
                        vec![(j % 200) as u8 + 1],
                    ));
                }
            }
        }
        changes
    }

    fn block_two() -> Vec<Change> {
        vec![
            Change::PutAccount(address(3), Account::new(99, U256::from(5))),
            Change::PutAccount(address(200), Account::new(1, U256::from(42))),
            Change::DeleteAccount(address(7)),
            Change::PutStorage(
                address(4),
                1,
                alloy_primitives::keccak256(2u64.to_be_bytes()).into(),
                vec![0xaa],
            ),
            Change::DeleteStorage(
                address(8),
                1,
                alloy_primitives::keccak256(1u64.to_be_bytes()).into(),
            ),
        ]
    }

    #[test]
    fn genesis_only_is_a_no_op() {
        let fixture = ChainFixture::new();
        let s = run_stage(&fixture.kv).unwrap();
        assert!(s.is_done());
        assert_eq!(s.block_number, 0);
        assert!(s.stage_data.is_empty());
        assert!(ih_bucket(&fixture.kv).is_empty());
    }

    #[test]
    fn first_run_regenerates_to_the_header_root() {
        let mut fixture = ChainFixture::new();
        fixture.apply_block(block_one());

        let s = run_stage(&fixture.kv).unwrap();
        assert!(s.is_done());
        assert_eq!(s.block_number, 1);
        assert!(s.stage_data.is_empty());
        assert!(!ih_bucket(&fixture.kv).is_empty());

        // a second run with no new blocks only re-reads
        let s = run_stage(&fixture.kv).unwrap();
        assert!(s.is_done());
        assert_eq!(s.block_number, 1);
    }

    #[test]
    fn increment_equals_regenerate() {
        let mut incremental = ChainFixture::new();
        incremental.apply_block(block_one());
        run_stage(&incremental.kv).unwrap();
        incremental.apply_block(block_two());
        let s = run_stage(&incremental.kv).unwrap();
        assert_eq!(s.block_number, 2);

        // the same chain hashed in one shot at height 2
        let mut fresh = ChainFixture::new();
        fresh.apply_block(block_one());
        fresh.apply_block(block_two());
        let s = run_stage(&fresh.kv).unwrap();
        assert_eq!(s.block_number, 2);

        assert_eq!(ih_bucket(&incremental.kv), ih_bucket(&fresh.kv));
    }

    #[test]
    fn corrupted_hashed_state_fails_regeneration() {
        let mut fixture = ChainFixture::new();
        fixture.apply_block(block_one());

        // flip one account's balance in the hashed state only; the full
        // walk streams every leaf, so the root cannot match the header
        let victim = stratus_primitives::keccak256(address(20).as_slice());
        let corrupted = Account::new(20, U256::from(123_456_789u64));
        let mut tx = fixture.kv.begin_mut().unwrap();
        TxMut::put(
            &mut tx,
            tables::HASHED_STATE,
            victim.as_slice(),
            &corrupted.encode_for_storage(),
        )
        .unwrap();
        TxMut::commit(tx).unwrap();

        let err = run_stage(&fixture.kv).unwrap_err();
        assert!(matches!(err, StageError::WrongTrieRoot { .. }));
        // progress is untouched by the failed run
        let s = StageState::load(&fixture.kv, StageId::IntermediateHashes).unwrap();
        assert_eq!(s.block_number, 0);
    }

    #[test]
    fn corrupted_plain_state_fails_increment() {
        let mut fixture = ChainFixture::new();
        fixture.apply_block(block_one());
        run_stage(&fixture.kv).unwrap();
        fixture.apply_block(block_two());

        // corrupt the plain-state row of an account touched by block two;
        // the increment re-reads it and folds the wrong leaf
        let corrupted = Account::new(99, U256::from(31_337));
        let mut tx = fixture.kv.begin_mut().unwrap();
        TxMut::put(
            &mut tx,
            tables::PLAIN_STATE,
            address(3).as_slice(),
            &corrupted.encode_for_storage(),
        )
        .unwrap();
        TxMut::commit(tx).unwrap();

        let err = run_stage(&fixture.kv).unwrap_err();
        assert!(matches!(err, StageError::WrongTrieRoot { .. }));
        let s = StageState::load(&fixture.kv, StageId::IntermediateHashes).unwrap();
        assert_eq!(s.block_number, 1);
    }

    #[test]
    fn resumes_after_account_phase_checkpoint() {
        let mut fixture = ChainFixture::new();
        fixture.apply_block(block_one());
        run_stage(&fixture.kv).unwrap();
        fixture.apply_block(block_two());

        // simulate a crash after the account phase flushed up to some key
        let checkpoint = stratus_primitives::keccak256(address(3).as_slice());
        let mut data = vec![ACCOUNT_PHASE];
        data.extend_from_slice(checkpoint.as_slice());
        let mut tx = fixture.kv.begin_mut().unwrap();
        save_stage_progress(&mut tx, StageId::IntermediateHashes, 1, &data).unwrap();
        TxMut::commit(tx).unwrap();

        let s = run_stage(&fixture.kv).unwrap();
        assert!(s.is_done());
        assert_eq!(s.block_number, 2);
        assert!(s.stage_data.is_empty());
    }

    #[test]
    fn resumes_after_completed_phases() {
        let mut fixture = ChainFixture::new();
        fixture.apply_block(block_one());
        run_stage(&fixture.kv).unwrap();
        fixture.apply_block(block_two());

        // crash after both phases completed, before the re-fold
        let mut tx = fixture.kv.begin_mut().unwrap();
        save_stage_progress(&mut tx, StageId::IntermediateHashes, 1, &[STORAGE_PHASE]).unwrap();
        TxMut::commit(tx).unwrap();

        let s = run_stage(&fixture.kv).unwrap();
        assert!(s.is_done());
        assert_eq!(s.block_number, 2);
    }

    #[test]
    fn unwind_resets_and_the_next_run_rederives() {
        let mut fixture = ChainFixture::new();
        fixture.apply_block(block_one());
        run_stage(&fixture.kv).unwrap();
        fixture.apply_block(block_two());
        run_stage(&fixture.kv).unwrap();

        // the chain reorganizes: execution rewinds to height 1, keeping the
        // change-sets of the abandoned block around until re-execution
        let unwind = UnwindState::new(StageId::IntermediateHashes, 1);
        let mut s = StageState::load(&fixture.kv, StageId::IntermediateHashes).unwrap();
        unwind_intermediate_hashes_stage(&unwind, &mut s, &fixture.kv).unwrap();
        let s = StageState::load(&fixture.kv, StageId::IntermediateHashes).unwrap();
        assert_eq!(s.block_number, 1);
        assert!(s.stage_data.is_empty());

        fixture.revert_to(1);

        // a different block 2 lands on the new canonical chain
        fixture.apply_block(vec![
            Change::PutAccount(address(500), Account::new(1, U256::from(1))),
            Change::PutAccount(address(3), Account::new(77, U256::from(8))),
        ]);
        let s = run_stage(&fixture.kv).unwrap();
        assert!(s.is_done());
        assert_eq!(s.block_number, 2);
    }

    #[test]
    fn cancellation_leaves_progress_untouched() {
        let mut fixture = ChainFixture::new();
        fixture.apply_block(block_one());

        let cancel = CancelToken::new();
        cancel.cancel();
        let mut s = StageState::load(&fixture.kv, StageId::IntermediateHashes).unwrap();
        let err =
            spawn_intermediate_hashes_stage(&mut s, &fixture.kv, &std::env::temp_dir(), &cancel)
                .unwrap_err();
        assert!(err.is_canceled());
        let s = StageState::load(&fixture.kv, StageId::IntermediateHashes).unwrap();
        assert_eq!(s.block_number, 0);
    }
}
