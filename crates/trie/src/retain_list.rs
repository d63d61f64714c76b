//! The retain list: keys whose trie paths must be re-walked instead of
//! served from cached subtree hashes.

use stratus_primitives::keys::{HASHED_STORAGE_KEY_LENGTH, HASH_LENGTH};

/// Sorted sets of changed hashed keys with prefix queries.
///
/// Because only even-length nibble paths are persisted, a path prefix is a
/// byte prefix, so queries operate on packed keys directly. A storage key
/// also retains its account's path: the account leaf embeds the storage root.
///
/// Resume floors conservatively retain everything at or below a key when the
/// per-key change list for that prefix was lost with the process.
#[derive(Debug, Default)]
pub struct RetainList {
    accounts: Vec<Vec<u8>>,
    storages: Vec<Vec<u8>>,
    account_floor: Option<Vec<u8>>,
    storage_floor: Option<Vec<u8>>,
    retain_all_accounts: bool,
    retain_all_storage: bool,
    sorted: bool,
}

impl RetainList {
    /// An empty list: every cached subtree hash is usable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a hashed key (32-byte account or 72-byte storage).
    ///
    /// Keys of other lengths are ignored; the caller validated them when
    /// hashing the plain key.
    pub fn add_key(&mut self, key: &[u8]) {
        match key.len() {
            HASH_LENGTH => self.accounts.push(key.to_vec()),
            HASHED_STORAGE_KEY_LENGTH => {
                self.storages.push(key.to_vec());
                self.accounts.push(key[..HASH_LENGTH].to_vec());
            }
            _ => {}
        }
        self.sorted = false;
    }

    /// Retains every account path at or below `key`.
    pub fn retain_accounts_below(&mut self, key: &[u8]) {
        self.account_floor = Some(key.to_vec());
    }

    /// Retains every storage path at or below `key`.
    pub fn retain_storage_below(&mut self, key: &[u8]) {
        self.storage_floor = Some(key.to_vec());
        if key.len() >= HASH_LENGTH {
            self.retain_accounts_below(&key[..HASH_LENGTH]);
        }
    }

    /// Retains every account path.
    pub fn retain_all_accounts(&mut self) {
        self.retain_all_accounts = true;
    }

    /// Retains every storage path.
    pub fn retain_all_storage(&mut self) {
        self.retain_all_storage = true;
        self.retain_all_accounts();
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() &&
            self.storages.is_empty() &&
            self.account_floor.is_none() &&
            self.storage_floor.is_none() &&
            !self.retain_all_accounts &&
            !self.retain_all_storage
    }

    fn ensure_sorted(&mut self) {
        if !self.sorted {
            self.accounts.sort_unstable();
            self.accounts.dedup();
            self.storages.sort_unstable();
            self.storages.dedup();
            self.sorted = true;
        }
    }

    /// Whether an account subtree at the packed path `prefix` contains a
    /// retained key.
    pub fn retains_account_prefix(&mut self, prefix: &[u8]) -> bool {
        if self.retain_all_accounts {
            return true;
        }
        if self.account_floor.as_deref().is_some_and(|floor| prefix <= floor) {
            return true;
        }
        self.ensure_sorted();
        has_prefixed_key(&self.accounts, prefix)
    }

    /// Whether a storage subtree at the packed bucket-key `prefix`
    /// (`hashed address ++ incarnation ++ packed slot path`) contains a
    /// retained key.
    pub fn retains_storage_prefix(&mut self, prefix: &[u8]) -> bool {
        if self.retain_all_storage {
            return true;
        }
        if self.storage_floor.as_deref().is_some_and(|floor| prefix <= floor) {
            return true;
        }
        self.ensure_sorted();
        has_prefixed_key(&self.storages, prefix)
    }
}

fn has_prefixed_key(keys: &[Vec<u8>], prefix: &[u8]) -> bool {
    let idx = keys.partition_point(|key| key.as_slice() < prefix);
    keys.get(idx).is_some_and(|key| key.starts_with(prefix))
}
