//! Account representations.
//!
//! [`Account`] is the record stored in the plain and hashed state buckets.
//! [`TrieAccount`] is the RLP form hashed into the state trie.

use crate::constants::{EMPTY_ROOT_HASH, KECCAK_EMPTY};
use alloy_primitives::{B256, U256};
use alloy_rlp::{RlpDecodable, RlpEncodable};

/// An Ethereum account as stored in the state buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Account {
    /// Number of transactions sent from this account.
    pub nonce: u64,
    /// Account balance in wei.
    pub balance: U256,
    /// Incarnation of the contract storage. Bumped when a contract is
    /// self-destructed and re-created at the same address, so stale storage
    /// rows sort under a dead prefix instead of resurfacing.
    pub incarnation: u64,
    /// Hash of the account's bytecode; [`KECCAK_EMPTY`] for EOAs.
    pub code_hash: B256,
}

impl Account {
    /// A fresh account with no code.
    pub fn new(nonce: u64, balance: U256) -> Self {
        Self { nonce, balance, incarnation: 1, code_hash: KECCAK_EMPTY }
    }

    /// Whether the account carries contract code.
    pub fn has_code(&self) -> bool {
        self.code_hash != KECCAK_EMPTY && self.code_hash != B256::ZERO
    }

    /// Encodes the account for a state bucket value.
    pub fn encode_for_storage(&self) -> Vec<u8> {
        alloy_rlp::encode(self)
    }

    /// Decodes an account from a state bucket value.
    pub fn decode_for_storage(mut buf: &[u8]) -> Result<Self, alloy_rlp::Error> {
        <Self as alloy_rlp::Decodable>::decode(&mut buf)
    }
}

/// The RLP form of an account fed to the trie hash builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TrieAccount {
    /// Account nonce.
    pub nonce: u64,
    /// Account balance.
    pub balance: U256,
    /// Root of the account's storage trie.
    pub storage_root: B256,
    /// Hash of the account bytecode.
    pub code_hash: B256,
}

impl From<(Account, B256)> for TrieAccount {
    fn from((account, storage_root): (Account, B256)) -> Self {
        Self {
            nonce: account.nonce,
            balance: account.balance,
            storage_root,
            code_hash: if account.code_hash == B256::ZERO {
                KECCAK_EMPTY
            } else {
                account.code_hash
            },
        }
    }
}

impl TrieAccount {
    /// RLP for a leaf of an account with no storage entries.
    pub fn from_account_no_storage(account: Account) -> Self {
        Self::from((account, EMPTY_ROOT_HASH))
    }
}
