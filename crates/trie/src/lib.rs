//! Streaming computation of the state trie root from the hashed-state bucket,
//! substituting cached subtree hashes for unmodified regions.
//!
//! The [`SubTrieLoader`] walks the hashed state and the intermediate-hash
//! bucket side by side, emitting a stream of items (leaves, cached subtree
//! hashes, a final cutoff) to a pluggable [`StreamReceiver`]. The
//! [`DefaultReceiver`] folds that stream back into subtree roots with a
//! [`HashBuilder`], reporting every newly formed branch hash to a
//! [`HashCollector`] so it can be persisted for the next incremental run.

#![warn(missing_debug_implementations, unreachable_pub, rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]

mod error;
mod hash_builder;
mod loader;
mod nibbles;
mod node;
mod retain_list;
mod stream;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::TrieError;
pub use hash_builder::HashBuilder;
pub use loader::SubTrieLoader;
pub use nibbles::{pack_nibbles, unpack_nibbles, Nibbles};
pub use retain_list::RetainList;
pub use stream::{
    DefaultReceiver, HashCollector, SharedHashCollector, StreamItem, StreamReceiver, SubTries,
};
