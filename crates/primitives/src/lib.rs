//! Core types shared by the stratus sync pipeline: accounts, headers and the
//! key schemas of the persisted buckets.

#![warn(missing_debug_implementations, unreachable_pub, rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]

pub mod account;
pub mod constants;
pub mod header;
pub mod keys;

pub use account::{Account, TrieAccount};
pub use constants::{EMPTY_ROOT_HASH, KECCAK_EMPTY};
pub use header::Header;

pub use alloy_primitives::{keccak256, Address, B256, U256};

/// A block number.
pub type BlockNumber = u64;
