//! Stage implementations.
//!
//! Only the intermediate-hashes stage lives in the core; download, execution
//! and indexing stages are collaborators registered by the embedding node as
//! `(exec, unwind)` records conforming to the same contract.

mod intermediate_hashes;

pub use intermediate_hashes::{
    intermediate_hashes_stage, spawn_intermediate_hashes_stage, unwind_intermediate_hashes_stage,
};
