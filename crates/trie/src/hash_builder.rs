//! Stack-based trie hash builder.
//!
//! Consumes leaves and cached subtree hashes in strictly increasing key
//! order and folds them into branch and extension nodes, keeping the merkle
//! root of everything added so far on top of an internal stack. Every branch
//! node large enough to be referenced by hash is reported to the optional
//! branch sink; those are the hashes the intermediate-hash bucket caches.

use crate::{
    node::{node_ref, word_rlp, BranchNode, ExtensionNode, LeafNode, KECCAK_LENGTH},
    Nibbles, TrieError,
};
use alloy_primitives::{keccak256, B256};
use stratus_primitives::EMPTY_ROOT_HASH;

/// Sink receiving `(nibble path, hash)` for each hashed branch node formed.
pub(crate) type BranchSink<'c> = Box<dyn FnMut(&[u8], B256) -> Result<(), TrieError> + 'c>;

enum HashBuilderValue {
    Bytes(Vec<u8>),
    Hash(B256),
}

impl std::fmt::Debug for HashBuilderValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Hash(hash) => write!(f, "Hash({hash})"),
        }
    }
}

/// Folds sorted `(path, value)` pairs into a Merkle-Patricia root.
pub struct HashBuilder<'c> {
    key: Nibbles,
    value: HashBuilderValue,
    stack: Vec<Vec<u8>>,
    groups: Vec<u16>,
    sink: Option<BranchSink<'c>>,
}

impl std::fmt::Debug for HashBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashBuilder")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("stack_len", &self.stack.len())
            .field("groups", &self.groups)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl Default for HashBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'c> HashBuilder<'c> {
    /// A builder that does not report branch hashes.
    pub fn new() -> Self {
        Self {
            key: Nibbles::new(),
            value: HashBuilderValue::Bytes(Vec::new()),
            stack: Vec::new(),
            groups: Vec::new(),
            sink: None,
        }
    }

    /// A builder reporting each hashed branch node to `sink`.
    pub fn with_branch_sink(
        sink: impl FnMut(&[u8], B256) -> Result<(), TrieError> + 'c,
    ) -> Self {
        let mut builder = Self::new();
        builder.sink = Some(Box::new(sink));
        builder
    }

    /// Adds a leaf. `value` is the leaf's RLP payload. Keys must arrive in
    /// strictly increasing order.
    pub fn add_leaf(&mut self, key: Nibbles, value: &[u8]) -> Result<(), TrieError> {
        if key <= self.key && !self.key.is_empty() {
            return Err(TrieError::OutOfOrder);
        }
        if !self.key.is_empty() {
            self.fold(&key)?;
        }
        self.key = key;
        self.value = HashBuilderValue::Bytes(value.to_vec());
        Ok(())
    }

    /// Substitutes a cached subtree hash at `key` for the whole subtree.
    pub fn add_branch(&mut self, key: Nibbles, hash: B256) -> Result<(), TrieError> {
        if key <= self.key && !(self.key.is_empty() && key.is_empty()) {
            return Err(TrieError::OutOfOrder);
        }
        if self.key.is_empty() {
            self.stack.push(word_rlp(&hash));
        } else {
            self.fold(&key)?;
        }
        self.key = key;
        self.value = HashBuilderValue::Hash(hash);
        Ok(())
    }

    /// Folds everything added so far and returns the root, resetting the
    /// pending element.
    pub fn root(&mut self) -> Result<B256, TrieError> {
        if !self.key.is_empty() {
            self.fold(&Nibbles::new())?;
            self.key.clear();
            self.value = HashBuilderValue::Bytes(Vec::new());
        }
        Ok(self.current_root())
    }

    fn current_root(&self) -> B256 {
        match self.stack.last() {
            Some(node) if node.len() == KECCAK_LENGTH + 1 => B256::from_slice(&node[1..]),
            Some(node) => keccak256(node),
            None => EMPTY_ROOT_HASH,
        }
    }

    /// Collapses the pending element against the `succeeding` key, hashing
    /// every node that can no longer be extended.
    fn fold(&mut self, succeeding: &Nibbles) -> Result<(), TrieError> {
        let mut build_extensions = false;
        let mut current = self.key.clone();

        loop {
            let preceding_exists = !self.groups.is_empty();
            let preceding_len = self.groups.len().saturating_sub(1);

            let common_prefix_len = succeeding.common_prefix_len(&current);
            let len = preceding_len.max(common_prefix_len);
            debug_assert!(len < current.len());

            let extra_digit = current.at(len);
            if self.groups.len() <= len {
                self.groups.resize(len + 1, 0u16);
            }
            self.groups[len] |= 1u16 << extra_digit;

            let mut len_from = len;
            if !succeeding.is_empty() || preceding_exists {
                len_from += 1;
            }
            let short_node_key = current.offset(len_from);

            if !build_extensions {
                match &self.value {
                    HashBuilderValue::Bytes(leaf_value) => {
                        let rlp = LeafNode::new(&short_node_key, leaf_value).rlp();
                        self.stack.push(node_ref(rlp));
                    }
                    HashBuilderValue::Hash(hash) => {
                        self.stack.push(word_rlp(hash));
                        build_extensions = true;
                    }
                }
            }

            if build_extensions && !short_node_key.is_empty() {
                let child = self.stack.pop().expect("extension node requires a child");
                let rlp = ExtensionNode::new(&short_node_key, &child).rlp();
                self.stack.push(node_ref(rlp));
            }

            if preceding_len <= common_prefix_len && !succeeding.is_empty() {
                return Ok(());
            }

            if !succeeding.is_empty() || preceding_exists {
                self.push_branch_node(&current, len)?;
            }

            self.groups.resize(len, 0u16);

            if preceding_len == 0 {
                return Ok(());
            }

            current.truncate(preceding_len);
            while self.groups.last() == Some(&0) {
                self.groups.pop();
            }
            build_extensions = true;
        }
    }

    /// Replaces the branch's children on the stack with the composed branch
    /// node, reporting its hash when it is referenced by hash.
    fn push_branch_node(&mut self, current: &Nibbles, len: usize) -> Result<(), TrieError> {
        let state_mask = self.groups[len];
        let rlp = BranchNode::new(&self.stack).rlp(state_mask);
        let first_child = self.stack.len() - state_mask.count_ones() as usize;
        self.stack.truncate(first_child);
        if rlp.len() >= KECCAK_LENGTH {
            let hash = keccak256(&rlp);
            if let Some(sink) = self.sink.as_mut() {
                sink(current.slice(0, len).as_slice(), hash)?;
            }
            self.stack.push(word_rlp(&hash));
        } else {
            self.stack.push(rlp);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::reference::trie_root;
    use hex_literal::hex;
    use std::collections::BTreeMap;

    fn assert_matches_reference(data: Vec<(Vec<u8>, Vec<u8>)>) {
        let sorted: BTreeMap<_, _> = data.into_iter().collect();
        let mut hb = HashBuilder::new();
        for (key, value) in &sorted {
            hb.add_leaf(Nibbles::unpack(key), value).unwrap();
        }
        assert_eq!(hb.root().unwrap(), trie_root(&sorted));
    }

    #[test]
    fn empty_trie() {
        assert_eq!(HashBuilder::new().root().unwrap(), EMPTY_ROOT_HASH);
    }

    #[test]
    fn raw_data_matches_reference() {
        assert_matches_reference(vec![
            (hex!("646f").to_vec(), hex!("76657262").to_vec()),
            (hex!("676f6f64").to_vec(), hex!("7075707079").to_vec()),
            (hex!("676f6b32").to_vec(), hex!("7075707079").to_vec()),
            (hex!("676f6b34").to_vec(), hex!("7075707079").to_vec()),
        ]);
    }

    #[test]
    fn hashed_keys_match_reference() {
        let data = (0u64..64)
            .map(|i| {
                let key = keccak256(i.to_be_bytes()).to_vec();
                let value = alloy_rlp::encode(&i.to_be_bytes()[..]);
                (key, value)
            })
            .collect();
        assert_matches_reference(data);
    }

    #[test]
    fn out_of_order_leaf_is_rejected() {
        let mut hb = HashBuilder::new();
        hb.add_leaf(Nibbles::unpack(&[0x20]), b"b").unwrap();
        let err = hb.add_leaf(Nibbles::unpack(&[0x10]), b"a").unwrap_err();
        assert!(matches!(err, TrieError::OutOfOrder));
    }

    #[test]
    fn root_from_single_cached_branch() {
        let hash = B256::repeat_byte(0x9f);
        let mut hb = HashBuilder::new();
        hb.add_branch(Nibbles::new(), hash).unwrap();
        assert_eq!(hb.root().unwrap(), hash);
    }

    #[test]
    fn collected_branch_substitutes_for_its_subtree() {
        // 256 hashed keys guarantee hashed (collectable) branch nodes
        let data: BTreeMap<Vec<u8>, Vec<u8>> = (0u64..256)
            .map(|i| {
                (keccak256(i.to_be_bytes()).to_vec(), alloy_rlp::encode(&i.to_be_bytes()[..]))
            })
            .collect();

        let mut collected: Vec<(Vec<u8>, B256)> = Vec::new();
        let mut hb = HashBuilder::with_branch_sink(|path, hash| {
            collected.push((path.to_vec(), hash));
            Ok(())
        });
        for (key, value) in &data {
            hb.add_leaf(Nibbles::unpack(key), value).unwrap();
        }
        let root = hb.root().unwrap();
        drop(hb);

        // deepest even-length collected path, for a packable bucket key
        let (path, hash) = collected
            .iter()
            .filter(|(p, _)| !p.is_empty() && p.len() % 2 == 0)
            .max_by_key(|(p, _)| p.len())
            .expect("a hashed branch at even depth")
            .clone();

        let mut hb = HashBuilder::new();
        let mut substituted = false;
        for (key, value) in &data {
            let nibbles = Nibbles::unpack(key);
            if nibbles.as_slice().starts_with(&path) {
                if !substituted {
                    hb.add_branch(Nibbles::from_hex(path.clone()), hash).unwrap();
                    substituted = true;
                }
                continue;
            }
            hb.add_leaf(nibbles, value).unwrap();
        }
        assert!(substituted);
        assert_eq!(hb.root().unwrap(), root);
    }
}
