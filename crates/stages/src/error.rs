use alloy_primitives::B256;
use stratus_etl::EtlError;
use stratus_kv::KvError;
use stratus_trie::TrieError;
use thiserror::Error;

/// A stage or pipeline execution error.
#[derive(Debug, Error)]
pub enum StageError {
    /// The recomputed trie root does not match the canonical header.
    ///
    /// Fatal for the stage; the operator unwinds past the bad block and
    /// reruns.
    #[error("wrong trie root: {got}, expected: {expected}")]
    WrongTrieRoot {
        /// Root produced by the walk.
        got: B256,
        /// Root recorded in the canonical header.
        expected: B256,
    },
    /// A stage id was used that is not registered with the pipeline.
    #[error("stage not found with id: {0}")]
    StageNotFound(u8),
    /// The canonical header for a height is missing.
    #[error("canonical header #{0} not found")]
    HeaderNotFound(u64),
    /// A persisted stage progress row failed to decode.
    #[error("invalid stage progress encoding")]
    CorruptProgress,
    /// Database error, including cancellation.
    #[error(transparent)]
    Kv(#[from] KvError),
    /// ETL engine error.
    #[error(transparent)]
    Etl(#[from] EtlError),
    /// Trie loader error.
    #[error(transparent)]
    Trie(#[from] TrieError),
    /// A persisted value failed to decode.
    #[error("state value decode error: {0}")]
    Decode(#[from] alloy_rlp::Error),
}

impl StageError {
    /// Whether this error is the cooperative cancellation signal.
    pub fn is_canceled(&self) -> bool {
        match self {
            StageError::Kv(KvError::Canceled) => true,
            StageError::Etl(err) => err.is_canceled(),
            StageError::Trie(err) => err.is_canceled(),
            _ => false,
        }
    }
}
