use thiserror::Error;

/// Errors surfaced by the key-value layer.
///
/// A missing key is not an error; reads return `Option`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    /// The operation observed the cancellation signal.
    #[error("operation canceled")]
    Canceled,
    /// The named bucket is not part of the schema.
    #[error("bucket not found: {0}")]
    BucketNotFound(&'static str),
}
