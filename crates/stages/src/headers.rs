//! Canonical-chain accessors used by derived stages.

use crate::StageError;
use alloy_primitives::B256;
use stratus_kv::{tables, Tx, TxMut};
use stratus_primitives::Header;

fn header_key(number: u64, hash: &B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + 32);
    key.extend_from_slice(&number.to_be_bytes());
    key.extend_from_slice(hash.as_slice());
    key
}

/// Hash of the canonical block at `number`.
pub fn read_canonical_hash<T: Tx>(tx: &T, number: u64) -> Result<Option<B256>, StageError> {
    match tx.get(tables::CANONICAL_HEADERS, &number.to_be_bytes())? {
        Some(value) if value.len() == 32 => Ok(Some(B256::from_slice(&value))),
        Some(_) => Err(StageError::CorruptProgress),
        None => Ok(None),
    }
}

/// Reads a header by number and hash.
pub fn read_header<T: Tx>(
    tx: &T,
    number: u64,
    hash: &B256,
) -> Result<Option<Header>, StageError> {
    match tx.get(tables::HEADERS, &header_key(number, hash))? {
        Some(value) => {
            let header = <Header as alloy_rlp::Decodable>::decode(&mut value.as_slice())?;
            Ok(Some(header))
        }
        None => Ok(None),
    }
}

/// State root recorded in the canonical header at `number`.
pub fn read_canonical_state_root<T: Tx>(tx: &T, number: u64) -> Result<B256, StageError> {
    let hash = read_canonical_hash(tx, number)?.ok_or(StageError::HeaderNotFound(number))?;
    let header = read_header(tx, number, &hash)?.ok_or(StageError::HeaderNotFound(number))?;
    Ok(header.state_root)
}

/// Writes a header and marks it canonical at its height.
pub fn write_canonical_header<T: TxMut>(tx: &mut T, header: &Header) -> Result<(), StageError> {
    let hash = header.hash();
    TxMut::put(tx, tables::CANONICAL_HEADERS, &header.number.to_be_bytes(), hash.as_slice())?;
    TxMut::put(tx, tables::HEADERS, &header_key(header.number, &hash), &alloy_rlp::encode(header))?;
    Ok(())
}
