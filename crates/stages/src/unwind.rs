//! Pending unwind entries and their persistent LIFO stack.

use crate::{
    progress::{delete_stage_unwind, get_stage_unwind, save_stage_progress, save_stage_unwind},
    StageError, StageId,
};
use stratus_etl::Putter;
use stratus_kv::{Kv, KvError, TxMut};

/// One pending rollback: a stage and the height to rewind it to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindState {
    /// Stage to roll back.
    pub stage: StageId,
    /// Height to roll back to.
    pub unwind_point: u64,
    /// Opaque resume state of an interrupted unwind.
    pub stage_data: Vec<u8>,
}

impl UnwindState {
    /// A fresh unwind intent.
    pub fn new(stage: StageId, unwind_point: u64) -> Self {
        Self { stage, unwind_point, stage_data: Vec::new() }
    }

    /// Consumes the entry after a successful unwind: resets the stage's
    /// progress to the unwind point and deletes the persisted row.
    pub fn done<K: Kv>(&self, db: &K) -> Result<(), StageError> {
        let mut tx = db.begin_mut()?;
        save_stage_progress(&mut tx, self.stage, self.unwind_point, &[])?;
        delete_stage_unwind(&mut tx, self.stage)?;
        tx.commit()?;
        Ok(())
    }

    /// Drops the entry without touching stage progress (the stage never got
    /// past the unwind point).
    pub fn skip<K: Kv>(&self, db: &K) -> Result<(), StageError> {
        let mut tx = db.begin_mut()?;
        delete_stage_unwind(&mut tx, self.stage)?;
        tx.commit()?;
        Ok(())
    }

    /// Records resume data for an interruptible unwind, in the caller's
    /// transaction.
    pub fn update_with_stage_data(
        &self,
        putter: &mut dyn Putter,
        stage_data: &[u8],
    ) -> Result<(), KvError> {
        save_stage_unwind(putter, self.stage, self.unwind_point, stage_data)
    }
}

/// In-memory LIFO mirror of the persisted unwind bucket.
///
/// Entries are pushed when a stage requests an unwind and drained by the
/// driver in reverse registration order.
#[derive(Debug, Default)]
pub struct PersistentUnwindStack {
    unwinds: Vec<UnwindState>,
}

impl PersistentUnwindStack {
    /// An empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any unwind is pending.
    pub fn is_empty(&self) -> bool {
        self.unwinds.is_empty()
    }

    /// Pops the most recently added entry.
    pub fn pop(&mut self) -> Option<UnwindState> {
        self.unwinds.pop()
    }

    /// Persists and pushes a new entry.
    pub fn add<K: Kv>(&mut self, unwind: UnwindState, db: &K) -> Result<(), StageError> {
        let mut tx = db.begin_mut()?;
        save_stage_unwind(&mut tx, unwind.stage, unwind.unwind_point, &unwind.stage_data)?;
        tx.commit()?;
        self.unwinds.push(unwind);
        Ok(())
    }

    /// Loads a stage's persisted entry, if any.
    pub fn add_from_db<K: Kv>(&mut self, db: &K, stage: StageId) -> Result<(), StageError> {
        let tx = db.begin()?;
        if let Some((unwind_point, stage_data)) = get_stage_unwind(&tx, stage)? {
            self.unwinds.push(UnwindState { stage, unwind_point, stage_data });
        }
        Ok(())
    }

    /// Loads one stage's persisted entry without pushing it.
    pub fn load_from_db<K: Kv>(
        db: &K,
        stage: StageId,
    ) -> Result<Option<UnwindState>, StageError> {
        let tx = db.begin()?;
        Ok(get_stage_unwind(&tx, stage)?
            .map(|(unwind_point, stage_data)| UnwindState { stage, unwind_point, stage_data }))
    }

    /// Drops all in-memory entries (the persisted rows stay).
    pub fn clear(&mut self) {
        self.unwinds.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::get_stage_progress;
    use stratus_kv::MemKv;

    #[test]
    fn lifo_order() {
        let kv = MemKv::new();
        let mut stack = PersistentUnwindStack::new();
        stack.add(UnwindState::new(StageId::Headers, 5), &kv).unwrap();
        stack.add(UnwindState::new(StageId::Bodies, 5), &kv).unwrap();
        assert_eq!(stack.pop().unwrap().stage, StageId::Bodies);
        assert_eq!(stack.pop().unwrap().stage, StageId::Headers);
        assert!(stack.pop().is_none());
    }

    #[test]
    fn entries_survive_restart_via_db() {
        let kv = MemKv::new();
        let mut stack = PersistentUnwindStack::new();
        stack.add(UnwindState::new(StageId::Senders, 3), &kv).unwrap();

        // a fresh stack (new process) reloads the persisted row
        let mut restarted = PersistentUnwindStack::new();
        for id in StageId::ALL {
            restarted.add_from_db(&kv, id).unwrap();
        }
        let entry = restarted.pop().unwrap();
        assert_eq!(entry, UnwindState::new(StageId::Senders, 3));
    }

    #[test]
    fn done_resets_progress_and_consumes_row() {
        let kv = MemKv::new();
        let mut tx = kv.begin_mut().unwrap();
        save_stage_progress(&mut tx, StageId::Bodies, 10, &[]).unwrap();
        stratus_kv::TxMut::commit(tx).unwrap();

        let mut stack = PersistentUnwindStack::new();
        stack.add(UnwindState::new(StageId::Bodies, 4), &kv).unwrap();
        let entry = stack.pop().unwrap();
        entry.done(&kv).unwrap();

        let tx = kv.begin().unwrap();
        assert_eq!(get_stage_progress(&tx, StageId::Bodies).unwrap(), (4, Vec::new()));
        assert_eq!(get_stage_unwind(&tx, StageId::Bodies).unwrap(), None);
    }

    #[test]
    fn skip_only_consumes_row() {
        let kv = MemKv::new();
        let mut stack = PersistentUnwindStack::new();
        stack.add(UnwindState::new(StageId::Finish, 4), &kv).unwrap();
        stack.pop().unwrap().skip(&kv).unwrap();

        let tx = kv.begin().unwrap();
        assert_eq!(get_stage_unwind(&tx, StageId::Finish).unwrap(), None);
        assert_eq!(get_stage_progress(&tx, StageId::Finish).unwrap(), (0, Vec::new()));
    }
}
