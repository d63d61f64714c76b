//! Stage identity and the stage record.

use crate::{StageError, StageState, UnwindState};
use std::fmt;
use stratus_kv::Kv;

/// Identity of a sync stage. The enumeration is fixed; new stages are
/// appended at the end so persisted ids stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum StageId {
    /// Download and verify headers.
    Headers = 0,
    /// Index header number → hash.
    BlockHashes = 1,
    /// Download block bodies.
    Bodies = 2,
    /// Recover transaction senders.
    Senders = 3,
    /// Execute blocks against plain state, producing change-sets.
    Execution = 4,
    /// Maintain the cached trie root over the hashed state.
    IntermediateHashes = 5,
    /// Maintain the hashed projection of plain state.
    HashState = 6,
    /// Index account history.
    AccountHistoryIndex = 7,
    /// Index storage history.
    StorageHistoryIndex = 8,
    /// Index transaction hash → block.
    TxLookup = 9,
    /// Feed the transaction pool.
    TxPool = 10,
    /// Terminal bookkeeping stage.
    Finish = 11,
}

impl StageId {
    /// All stage ids in enumeration order.
    pub const ALL: [StageId; 12] = [
        StageId::Headers,
        StageId::BlockHashes,
        StageId::Bodies,
        StageId::Senders,
        StageId::Execution,
        StageId::IntermediateHashes,
        StageId::HashState,
        StageId::AccountHistoryIndex,
        StageId::StorageHistoryIndex,
        StageId::TxLookup,
        StageId::TxPool,
        StageId::Finish,
    ];

    /// The persisted single-byte key of this stage.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a persisted stage id.
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Execution function of a stage.
///
/// The stage advances its own progress through the [`StageState`] handle and
/// marks itself finished with [`StageState::done`] or
/// [`StageState::done_and_update`]; the driver only moves to the next stage
/// once that happened.
pub type ExecFn<K> = Box<dyn Fn(&mut StageState, &K) -> Result<(), StageError>>;

/// Unwind function of a stage. Consumes the unwind entry with
/// [`UnwindState::done`] on success.
pub type UnwindFn<K> = Box<dyn Fn(&UnwindState, &mut StageState, &K) -> Result<(), StageError>>;

/// One unit of work in the sync pipeline: a tagged record with two function
/// fields, dispatched by the driver without any subtyping.
pub struct Stage<K: Kv> {
    /// Stable identity.
    pub id: StageId,
    /// Human-readable description used in progress logs.
    pub description: &'static str,
    /// Disabled stages are logged and skipped.
    pub disabled: bool,
    /// Reason shown when the stage is skipped.
    pub disabled_description: &'static str,
    /// Roll-forward entry point.
    pub exec: ExecFn<K>,
    /// Roll-back entry point; stages without derived state have none.
    pub unwind: Option<UnwindFn<K>>,
}

impl<K: Kv> Stage<K> {
    /// A minimal enabled stage.
    pub fn new(id: StageId, description: &'static str, exec: ExecFn<K>) -> Self {
        Self {
            id,
            description,
            disabled: false,
            disabled_description: "",
            exec,
            unwind: None,
        }
    }

    /// Attaches an unwind function.
    pub fn with_unwind(mut self, unwind: UnwindFn<K>) -> Self {
        self.unwind = Some(unwind);
        self
    }
}

impl<K: Kv> fmt::Debug for Stage<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("disabled", &self.disabled)
            .field("has_unwind", &self.unwind.is_some())
            .finish()
    }
}
