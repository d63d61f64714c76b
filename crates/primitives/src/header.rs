//! Reduced block header.
//!
//! The sync core only consumes the chain linkage and the state commitment;
//! consensus fields live with the collaborators that validate them.

use alloy_primitives::{keccak256, B256};
use alloy_rlp::{RlpDecodable, RlpEncodable};

/// A block header reduced to the fields the sync pipeline reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Header {
    /// Hash of the parent header.
    pub parent_hash: B256,
    /// Block height.
    pub number: u64,
    /// Root of the state trie after executing this block.
    pub state_root: B256,
    /// Block timestamp.
    pub timestamp: u64,
}

impl Header {
    /// Keccak-256 hash of the RLP-encoded header.
    pub fn hash(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable() {
        let header = Header { number: 7, ..Default::default() };
        assert_eq!(header.hash(), header.hash());
        let other = Header { number: 8, ..Default::default() };
        assert_ne!(header.hash(), other.hash());
    }
}
