use stratus_kv::KvError;
use thiserror::Error;

/// Errors surfaced by the trie loader and receivers.
#[derive(Debug, Error)]
pub enum TrieError {
    /// Database error, including cancellation.
    #[error(transparent)]
    Kv(#[from] KvError),
    /// A state bucket value failed to decode.
    #[error("state value decode error: {0}")]
    Decode(#[from] alloy_rlp::Error),
    /// The receiver observed keys out of sorted order.
    #[error("trie stream out of order")]
    OutOfOrder,
    /// A storage item arrived without a matching account context.
    #[error("storage item without account context")]
    OrphanStorage,
    /// An intermediate-hash row is not a 32-byte hash.
    #[error("corrupt intermediate hash row ({len} bytes)")]
    CorruptHashRow {
        /// Length of the offending value.
        len: usize,
    },
    /// Error raised by the hash collector sink.
    #[error("hash collector: {0}")]
    Collector(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl TrieError {
    /// Whether this error is the cooperative cancellation signal.
    pub fn is_canceled(&self) -> bool {
        matches!(self, TrieError::Kv(KvError::Canceled))
    }
}
