//! Key schemas for the persisted buckets.
//!
//! Plain state keys address by raw address (`20` bytes for accounts,
//! `address ++ incarnation ++ slot` = `60` bytes for storage). Hashed state
//! keys are the keccak projection used by the trie
//! (`32` bytes / `keccak(address) ++ incarnation ++ keccak(slot)` = `72`
//! bytes). Change-set keys prefix the plain key with a big-endian block
//! number so a prefix scan yields modifications in block order.

use alloy_primitives::{keccak256, Address, B256};
use thiserror::Error;

/// Length of a raw account address.
pub const ADDRESS_LENGTH: usize = 20;
/// Length of a keccak hash.
pub const HASH_LENGTH: usize = 32;
/// Length of the incarnation suffix in storage keys.
pub const INCARNATION_LENGTH: usize = 8;
/// Length of a plain storage key: `address ++ incarnation ++ slot`.
pub const PLAIN_STORAGE_KEY_LENGTH: usize = ADDRESS_LENGTH + INCARNATION_LENGTH + HASH_LENGTH;
/// Length of a hashed storage key: `keccak(address) ++ incarnation ++ keccak(slot)`.
pub const HASHED_STORAGE_KEY_LENGTH: usize = HASH_LENGTH + INCARNATION_LENGTH + HASH_LENGTH;
/// Length of the `hashed address ++ incarnation` prefix shared by all storage
/// rows of one contract.
pub const STORAGE_PREFIX_LENGTH: usize = HASH_LENGTH + INCARNATION_LENGTH;

/// A plain state key with an unexpected length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid plain state key length: {0}")]
pub struct InvalidPlainKey(pub usize);

/// Encodes a block number as the 8-byte big-endian bucket prefix.
pub fn encode_block_number(number: u64) -> [u8; 8] {
    number.to_be_bytes()
}

/// Decodes the 8-byte big-endian block number prefix of a change-set key.
pub fn decode_block_number(key: &[u8]) -> Option<u64> {
    let prefix: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(prefix))
}

/// Composes a change-set key: `be8(block) ++ plain_key`.
pub fn change_set_key(block: u64, plain_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + plain_key.len());
    key.extend_from_slice(&encode_block_number(block));
    key.extend_from_slice(plain_key);
    key
}

/// Composes a plain storage key: `address ++ incarnation ++ slot`.
pub fn plain_storage_key(address: Address, incarnation: u64, slot: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(PLAIN_STORAGE_KEY_LENGTH);
    key.extend_from_slice(address.as_slice());
    key.extend_from_slice(&incarnation.to_be_bytes());
    key.extend_from_slice(slot.as_slice());
    key
}

/// Composes a hashed storage key from its parts.
pub fn hashed_storage_key(address_hash: B256, incarnation: u64, slot_hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(HASHED_STORAGE_KEY_LENGTH);
    key.extend_from_slice(address_hash.as_slice());
    key.extend_from_slice(&incarnation.to_be_bytes());
    key.extend_from_slice(slot_hash.as_slice());
    key
}

/// Transforms a plain state key into its hashed counterpart.
///
/// Accounts: `keccak(address)`. Storage: `keccak(address) ++ incarnation ++
/// keccak(slot)`, preserving the incarnation bytes verbatim.
pub fn hash_plain_key(plain_key: &[u8]) -> Result<Vec<u8>, InvalidPlainKey> {
    match plain_key.len() {
        ADDRESS_LENGTH => Ok(keccak256(plain_key).to_vec()),
        PLAIN_STORAGE_KEY_LENGTH => {
            let mut key = Vec::with_capacity(HASHED_STORAGE_KEY_LENGTH);
            key.extend_from_slice(keccak256(&plain_key[..ADDRESS_LENGTH]).as_slice());
            key.extend_from_slice(
                &plain_key[ADDRESS_LENGTH..ADDRESS_LENGTH + INCARNATION_LENGTH],
            );
            key.extend_from_slice(
                keccak256(&plain_key[ADDRESS_LENGTH + INCARNATION_LENGTH..]).as_slice(),
            );
            Ok(key)
        }
        other => Err(InvalidPlainKey(other)),
    }
}
