//! Bucket registry for the sync pipeline.
//!
//! Every bucket the core touches is declared here so engines can create the
//! schema up front and tooling can iterate it.

/// Per-stage sync progress: `stage id byte → be8(block) ++ stage data`.
pub const SYNC_STAGE_PROGRESS: &str = "SyncStageProgress";

/// Pending unwind intents, same value schema as progress; presence of a row
/// means the stage still has an unwind to process.
pub const SYNC_STAGE_UNWIND: &str = "SyncStageUnwind";

/// Authoritative current state keyed by raw addresses
/// (`address` / `address ++ incarnation ++ slot`).
pub const PLAIN_STATE: &str = "PlainState";

/// Keccak projection of [`PLAIN_STATE`] in trie key order
/// (`keccak(address)` / `keccak(address) ++ incarnation ++ keccak(slot)`).
pub const HASHED_STATE: &str = "HashedState";

/// Cached subtree hashes: compressed nibble path → 32-byte keccak.
pub const INTERMEDIATE_TRIE_HASH: &str = "IntermediateTrieHash";

/// Account pre-images per block: `be8(block) ++ address → prior value`.
pub const PLAIN_ACCOUNT_CHANGE_SET: &str = "PlainAccountChangeSet";

/// Storage pre-images per block: `be8(block) ++ plain storage key → prior value`.
pub const PLAIN_STORAGE_CHANGE_SET: &str = "PlainStorageChangeSet";

/// Canonical chain index: `be8(number) → header hash`.
pub const CANONICAL_HEADERS: &str = "CanonicalHeaders";

/// Headers by `be8(number) ++ hash → rlp(header)`.
pub const HEADERS: &str = "Headers";

/// All buckets, in schema order.
pub const ALL: &[&str] = &[
    SYNC_STAGE_PROGRESS,
    SYNC_STAGE_UNWIND,
    PLAIN_STATE,
    HASHED_STATE,
    INTERMEDIATE_TRIE_HASH,
    PLAIN_ACCOUNT_CHANGE_SET,
    PLAIN_STORAGE_CHANGE_SET,
    CANONICAL_HEADERS,
    HEADERS,
];
