//! RLP forms of trie nodes.
//!
//! The hash builder keeps a stack of node *references*: the node's RLP when
//! it is shorter than 32 bytes (embedded in its parent), otherwise the
//! keccak hash wrapped as a 32-byte RLP string.

use crate::Nibbles;
use alloy_primitives::{keccak256, B256};
use alloy_rlp::{Encodable, Header, EMPTY_STRING_CODE};

/// Length of a keccak hash.
pub(crate) const KECCAK_LENGTH: usize = 32;

/// RLP string wrapping a 32-byte hash: `0xa0 ++ hash`.
pub(crate) fn word_rlp(hash: &B256) -> Vec<u8> {
    let mut out = Vec::with_capacity(KECCAK_LENGTH + 1);
    out.push(EMPTY_STRING_CODE + KECCAK_LENGTH as u8);
    out.extend_from_slice(hash.as_slice());
    out
}

/// Normalizes a node's RLP into the reference embedded in its parent.
pub(crate) fn node_ref(rlp: Vec<u8>) -> Vec<u8> {
    if rlp.len() < KECCAK_LENGTH {
        rlp
    } else {
        word_rlp(&keccak256(&rlp))
    }
}

/// Hex-prefix encoding of a path: parity and leaf flag in the first byte.
fn encode_path(path: &Nibbles, is_leaf: bool) -> Vec<u8> {
    let hex = path.as_slice();
    let odd = hex.len() % 2 == 1;
    let mut out = Vec::with_capacity(hex.len() / 2 + 1);
    out.push(match (is_leaf, odd) {
        (false, false) => 0x00,
        (false, true) => 0x10 + hex[0],
        (true, false) => 0x20,
        (true, true) => 0x30 + hex[0],
    });
    let rest = if odd { &hex[1..] } else { hex };
    for pair in rest.chunks_exact(2) {
        out.push((pair[0] << 4) | pair[1]);
    }
    out
}

/// A leaf node: `[encoded_path, value]`.
pub(crate) struct LeafNode<'a> {
    path: Vec<u8>,
    value: &'a [u8],
}

impl<'a> LeafNode<'a> {
    pub(crate) fn new(key: &Nibbles, value: &'a [u8]) -> Self {
        Self { path: encode_path(key, true), value }
    }

    pub(crate) fn rlp(&self) -> Vec<u8> {
        let payload_length =
            Encodable::length(self.path.as_slice()) + Encodable::length(self.value);
        let mut out = Vec::with_capacity(payload_length + 2);
        Header { list: true, payload_length }.encode(&mut out);
        self.path.as_slice().encode(&mut out);
        self.value.encode(&mut out);
        out
    }
}

/// An extension node: `[encoded_path, child_ref]`.
pub(crate) struct ExtensionNode<'a> {
    path: Vec<u8>,
    child: &'a [u8],
}

impl<'a> ExtensionNode<'a> {
    pub(crate) fn new(key: &Nibbles, child_ref: &'a [u8]) -> Self {
        Self { path: encode_path(key, false), child: child_ref }
    }

    pub(crate) fn rlp(&self) -> Vec<u8> {
        // the child reference is already a complete RLP item
        let payload_length = Encodable::length(self.path.as_slice()) + self.child.len();
        let mut out = Vec::with_capacity(payload_length + 2);
        Header { list: true, payload_length }.encode(&mut out);
        self.path.as_slice().encode(&mut out);
        out.extend_from_slice(self.child);
        out
    }
}

/// A branch node: 16 child slots plus an empty value slot.
pub(crate) struct BranchNode<'a> {
    stack: &'a [Vec<u8>],
}

impl<'a> BranchNode<'a> {
    pub(crate) fn new(stack: &'a [Vec<u8>]) -> Self {
        Self { stack }
    }

    /// Composes the branch from the top `state_mask.count_ones()` stack
    /// entries, one per set bit in nibble order.
    pub(crate) fn rlp(&self, state_mask: u16) -> Vec<u8> {
        let first_child = self.stack.len() - state_mask.count_ones() as usize;
        let mut payload_length = 1; // empty value slot
        let mut child = first_child;
        for digit in 0..16 {
            if state_mask & (1 << digit) != 0 {
                payload_length += self.stack[child].len();
                child += 1;
            } else {
                payload_length += 1;
            }
        }
        let mut out = Vec::with_capacity(payload_length + 4);
        Header { list: true, payload_length }.encode(&mut out);
        let mut child = first_child;
        for digit in 0..16 {
            if state_mask & (1 << digit) != 0 {
                out.extend_from_slice(&self.stack[child]);
                child += 1;
            } else {
                out.push(EMPTY_STRING_CODE);
            }
        }
        out.push(EMPTY_STRING_CODE);
        out
    }
}
