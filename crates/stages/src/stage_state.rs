//! The handle a stage uses to read and advance its own progress.

use crate::{
    progress::{get_stage_progress, save_stage_progress},
    StageError, StageId,
};
use stratus_etl::Putter;
use stratus_kv::{Kv, KvError, TxMut};

/// Snapshot of one stage's persisted progress plus the write surface for
/// advancing it.
///
/// `block_number` is the highest block fully processed; non-empty
/// `stage_data` marks an interrupted run that must be resumed before any
/// later stage may execute. A stage signals completion to the driver with
/// [`done`](Self::done) or [`done_and_update`](Self::done_and_update).
#[derive(Debug)]
pub struct StageState {
    /// The stage this handle belongs to.
    pub stage: StageId,
    /// Highest block fully processed by this stage.
    pub block_number: u64,
    /// Opaque resume state; empty once the stage completed for
    /// `block_number`.
    pub stage_data: Vec<u8>,
    done: bool,
}

impl StageState {
    pub(crate) fn new(stage: StageId, block_number: u64, stage_data: Vec<u8>) -> Self {
        Self { stage, block_number, stage_data, done: false }
    }

    /// Loads the stage's persisted state.
    pub fn load<K: Kv>(db: &K, stage: StageId) -> Result<Self, StageError> {
        let tx = db.begin()?;
        let (block_number, stage_data) = get_stage_progress(&tx, stage)?;
        Ok(Self::new(stage, block_number, stage_data))
    }

    /// Progress of the Execution stage, the authoritative upper bound for
    /// derived stages.
    pub fn execution_at<K: Kv>(&self, db: &K) -> Result<u64, StageError> {
        let tx = db.begin()?;
        Ok(get_stage_progress(&tx, StageId::Execution)?.0)
    }

    /// Writes progress with empty resume data, in the caller's transaction.
    pub fn update(&self, putter: &mut dyn Putter, block_number: u64) -> Result<(), KvError> {
        save_stage_progress(putter, self.stage, block_number, &[])
    }

    /// Writes progress with resume data, in the caller's transaction.
    pub fn update_with_stage_data(
        &self,
        putter: &mut dyn Putter,
        block_number: u64,
        stage_data: &[u8],
    ) -> Result<(), KvError> {
        save_stage_progress(putter, self.stage, block_number, stage_data)
    }

    /// Marks the stage complete for its current block, clearing resume data.
    /// Idempotent.
    pub fn done<K: Kv>(&mut self, db: &K) -> Result<(), StageError> {
        if !self.stage_data.is_empty() {
            let mut tx = db.begin_mut()?;
            save_stage_progress(&mut tx, self.stage, self.block_number, &[])?;
            tx.commit()?;
            self.stage_data.clear();
        }
        self.done = true;
        Ok(())
    }

    /// Marks the stage complete at `block_number`, clearing resume data.
    pub fn done_and_update<K: Kv>(&mut self, db: &K, block_number: u64) -> Result<(), StageError> {
        let mut tx = db.begin_mut()?;
        save_stage_progress(&mut tx, self.stage, block_number, &[])?;
        tx.commit()?;
        self.block_number = block_number;
        self.stage_data.clear();
        self.done = true;
        Ok(())
    }

    /// Whether the stage marked itself complete; the driver advances to the
    /// next stage only then.
    pub fn is_done(&self) -> bool {
        self.done
    }
}
