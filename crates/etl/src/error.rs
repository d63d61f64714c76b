use stratus_kv::KvError;
use thiserror::Error;

/// Errors surfaced by the ETL engine.
#[derive(Debug, Error)]
pub enum EtlError {
    /// Database error, including cancellation.
    #[error(transparent)]
    Kv(#[from] KvError),
    /// Spill file I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// No lexicographic successor exists for the requested key.
    #[error("etl: next key overflow")]
    NextKeyOverflow,
    /// Error raised by a user-supplied extract or load function.
    #[error(transparent)]
    User(Box<dyn std::error::Error + Send + Sync>),
}

impl EtlError {
    /// Whether this error is the cooperative cancellation signal.
    pub fn is_canceled(&self) -> bool {
        matches!(self, EtlError::Kv(KvError::Canceled))
    }
}
