use crate::KvError;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Single-shot cooperative cancellation signal.
///
/// Cloned into every long-running loop (ETL extract/load, trie walks, cursor
/// scans); once tripped it never resets. Loops observe it via [`check`] and
/// surface [`KvError::Canceled`] without committing partial work.
///
/// [`check`]: CancelToken::check
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A token that never fires.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the signal for every clone of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether the signal has been tripped.
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns [`KvError::Canceled`] once the signal is tripped.
    pub fn check(&self) -> Result<(), KvError> {
        if self.is_canceled() {
            Err(KvError::Canceled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_for_all_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(clone.check().is_ok());
        token.cancel();
        assert_eq!(clone.check(), Err(KvError::Canceled));
        assert!(token.is_canceled());
    }
}
