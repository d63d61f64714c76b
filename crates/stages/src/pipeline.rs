//! The staged-sync driver.
//!
//! Executes registered stages strictly in order, persisting per-stage
//! progress so a crashed run resumes where it stopped. Before the main loop,
//! the resume protocol finishes any stage that left resume data behind and
//! any unwind that was interrupted mid-run; during the loop, pending unwind
//! entries are drained LIFO before any stage executes.

use crate::{
    progress::get_stage_progress, PersistentUnwindStack, Stage, StageError, StageId, StageState,
    UnwindState,
};
use stratus_kv::Kv;
use tracing::info;

/// A staged sync pipeline over a fixed, ordered stage list.
#[derive(Debug)]
pub struct Pipeline<K: Kv> {
    stages: Vec<Stage<K>>,
    unwind_stack: PersistentUnwindStack,
    current_stage: usize,
}

impl<K: Kv> Pipeline<K> {
    /// Builds a pipeline over `stages`, ordered by dependency.
    pub fn new(stages: Vec<Stage<K>>) -> Self {
        Self { stages, unwind_stack: PersistentUnwindStack::new(), current_stage: 0 }
    }

    /// Number of registered stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether no stages are registered.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Whether every stage ran and no unwind is pending.
    pub fn is_done(&self) -> bool {
        self.current_stage >= self.stages.len() && self.unwind_stack.is_empty()
    }

    /// Advances to the next stage.
    pub fn next_stage(&mut self) {
        self.current_stage += 1;
    }

    /// The current stage index and record.
    pub fn current_stage(&self) -> (usize, &Stage<K>) {
        (self.current_stage, &self.stages[self.current_stage])
    }

    /// Repositions the pipeline at the stage with `id`.
    pub fn set_current_stage(&mut self, id: StageId) -> Result<(), StageError> {
        self.current_stage = self.index_of(id)?;
        Ok(())
    }

    /// Looks up a registered stage by id.
    pub fn stage_by_id(&self, id: StageId) -> Result<&Stage<K>, StageError> {
        Ok(&self.stages[self.index_of(id)?])
    }

    fn index_of(&self, id: StageId) -> Result<usize, StageError> {
        self.stages
            .iter()
            .position(|stage| stage.id == id)
            .ok_or(StageError::StageNotFound(id.as_u8()))
    }

    /// Progress of the Headers stage: the local chain height.
    pub fn local_height(&self, db: &K) -> Result<u64, StageError> {
        let tx = db.begin()?;
        Ok(get_stage_progress(&tx, StageId::Headers)?.0)
    }

    /// Queues an unwind of **every** stage to `block_number`. Stages whose
    /// own progress is already at or below the point are filtered out when
    /// their entry is processed, which keeps crash recovery simple at the
    /// cost of a few no-op pops.
    pub fn unwind_to(&mut self, db: &K, block_number: u64) -> Result<(), StageError> {
        info!(target: "sync::pipeline", block = block_number, "UnwindTo");
        for index in 0..self.stages.len() {
            let id = self.stages[index].id;
            self.unwind_stack.add(UnwindState::new(id, block_number), db)?;
        }
        Ok(())
    }

    /// Reloads persisted unwind intents into the in-memory stack.
    pub fn load_unwind_info(&mut self, db: &K) -> Result<(), StageError> {
        self.unwind_stack.clear();
        for index in 0..self.stages.len() {
            let id = self.stages[index].id;
            self.unwind_stack.add_from_db(db, id)?;
        }
        Ok(())
    }

    /// Executes stages until [`is_done`](Self::is_done), or returns early
    /// after draining a pending unwind.
    pub fn run(&mut self, db: &K) -> Result<(), StageError> {
        self.load_unwind_info(db)?;
        self.run_interrupted_stage(db)?;

        while !self.is_done() {
            if !self.unwind_stack.is_empty() {
                while let Some(unwind) = self.unwind_stack.pop() {
                    self.unwind_stage(&unwind, db)?;
                }
                return Ok(());
            }

            let index = self.current_stage;
            let stage = &self.stages[index];
            if stage.disabled {
                info!(
                    target: "sync::pipeline",
                    "Sync stage {}/{}. {} disabled. {}",
                    index + 1,
                    self.stages.len(),
                    stage.description,
                    stage.disabled_description,
                );
                self.current_stage += 1;
                continue;
            }

            if self.run_stage_at(index, db)? {
                self.current_stage += 1;
            }
        }
        Ok(())
    }

    /// Resume protocol: finish an interrupted stage execution first, then an
    /// interrupted unwind.
    fn run_interrupted_stage(&mut self, db: &K) -> Result<(), StageError> {
        let mut interrupted = None;
        {
            let tx = db.begin()?;
            for (index, stage) in self.stages.iter().enumerate() {
                let (_, stage_data) = get_stage_progress(&tx, stage.id)?;
                if !stage_data.is_empty() {
                    interrupted = Some(index);
                    break;
                }
            }
        }
        if let Some(index) = interrupted {
            info!(
                target: "sync::pipeline",
                stage = %self.stages[index].id,
                "Resuming interrupted stage"
            );
            self.run_stage_at(index, db)?;
            // restart from 0 after completing the missing stage; finished
            // stages short-circuit on their own progress
            self.current_stage = 0;
        }

        let mut interrupted_unwind = None;
        {
            let tx = db.begin()?;
            for stage in &self.stages {
                if let Some((_, stage_data)) = crate::progress::get_stage_unwind(&tx, stage.id)? {
                    if !stage_data.is_empty() {
                        interrupted_unwind = Some(stage.id);
                        break;
                    }
                }
            }
        }
        if let Some(id) = interrupted_unwind {
            if let Some(unwind) = PersistentUnwindStack::load_from_db(db, id)? {
                info!(target: "sync::pipeline", stage = %id, "Resuming interrupted unwind");
                self.unwind_stage(&unwind, db)?;
            }
        }
        Ok(())
    }

    /// Runs a single stage by id, outside the main loop.
    pub fn run_stage(&self, id: StageId, db: &K) -> Result<(), StageError> {
        let index = self.index_of(id)?;
        self.run_stage_at(index, db)?;
        Ok(())
    }

    fn run_stage_at(&self, index: usize, db: &K) -> Result<bool, StageError> {
        let stage = &self.stages[index];
        let mut state = StageState::load(db, stage.id)?;

        info!(
            target: "sync::pipeline",
            "Sync stage {}/{}. {}...",
            index + 1,
            self.stages.len(),
            stage.description,
        );
        (stage.exec)(&mut state, db)?;
        info!(target: "sync::pipeline", "Sync stage {}/{}. {} DONE!", index + 1, self.stages.len(), stage.description);
        Ok(state.is_done())
    }

    /// Processes one unwind entry: skips it when the stage never got past
    /// the unwind point, otherwise runs the stage's unwind function and
    /// restarts the sequence from the first stage.
    pub fn unwind_stage(&mut self, unwind: &UnwindState, db: &K) -> Result<(), StageError> {
        info!(target: "sync::pipeline", stage = %unwind.stage, to = unwind.unwind_point, "Unwinding...");
        let index = self.index_of(unwind.stage)?;
        {
            let stage = &self.stages[index];
            let Some(unwind_fn) = stage.unwind.as_ref() else {
                unwind.skip(db)?;
                return Ok(());
            };

            let mut state = StageState::load(db, stage.id)?;
            if state.block_number <= unwind.unwind_point {
                unwind.skip(db)?;
                return Ok(());
            }
            unwind_fn(unwind, &mut state, db)?;
        }
        // always restart from the first stage after an unwind
        self.current_stage = 0;
        info!(target: "sync::pipeline", "Unwinding... DONE!");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{save_stage_progress, save_stage_unwind};
    use std::{cell::RefCell, rc::Rc};
    use stratus_kv::{MemKv, TxMut};

    type Calls = Rc<RefCell<Vec<String>>>;

    /// A stage that records its invocations and syncs to Execution height.
    fn tracking_stage(id: StageId, calls: Calls) -> Stage<MemKv> {
        let exec_calls = calls.clone();
        let stage = Stage::new(
            id,
            "tracking",
            Box::new(move |s: &mut StageState, db: &MemKv| {
                exec_calls.borrow_mut().push(format!("exec:{id}"));
                let target = s.execution_at(db)?;
                if s.block_number == target {
                    s.done(db)?;
                } else {
                    s.done_and_update(db, target)?;
                }
                Ok(())
            }),
        );
        let unwind_calls = calls;
        stage.with_unwind(Box::new(move |u: &UnwindState, _s: &mut StageState, db: &MemKv| {
            unwind_calls.borrow_mut().push(format!("unwind:{}", u.stage));
            u.done(db)
        }))
    }

    fn set_execution_progress(kv: &MemKv, block: u64) {
        let mut tx = kv.begin_mut().unwrap();
        save_stage_progress(&mut tx, StageId::Execution, block, &[]).unwrap();
        TxMut::commit(tx).unwrap();
    }

    fn three_stage_pipeline(calls: &Calls) -> Pipeline<MemKv> {
        Pipeline::new(vec![
            tracking_stage(StageId::Headers, calls.clone()),
            tracking_stage(StageId::Bodies, calls.clone()),
            tracking_stage(StageId::Senders, calls.clone()),
        ])
    }

    #[test]
    fn runs_stages_in_order_until_done() {
        let kv = MemKv::new();
        set_execution_progress(&kv, 8);
        let calls: Calls = Default::default();
        let mut pipeline = three_stage_pipeline(&calls);

        pipeline.run(&kv).unwrap();
        assert!(pipeline.is_done());
        assert_eq!(
            *calls.borrow(),
            vec!["exec:Headers", "exec:Bodies", "exec:Senders"]
        );

        let tx = kv.begin().unwrap();
        assert_eq!(get_stage_progress(&tx, StageId::Senders).unwrap(), (8, Vec::new()));
    }

    #[test]
    fn second_run_is_a_no_op(){
        let kv = MemKv::new();
        set_execution_progress(&kv, 8);
        let calls: Calls = Default::default();

        let mut pipeline = three_stage_pipeline(&calls);
        pipeline.run(&kv).unwrap();
        let after_first = calls.borrow().len();

        let mut pipeline = three_stage_pipeline(&calls);
        pipeline.run(&kv).unwrap();
        // stages run but short-circuit on their own progress, writing nothing
        assert_eq!(calls.borrow().len(), after_first * 2);
        let tx = kv.begin().unwrap();
        assert_eq!(get_stage_progress(&tx, StageId::Bodies).unwrap(), (8, Vec::new()));
    }

    #[test]
    fn disabled_stages_are_skipped() {
        let kv = MemKv::new();
        set_execution_progress(&kv, 3);
        let calls: Calls = Default::default();
        let mut disabled = tracking_stage(StageId::Bodies, calls.clone());
        disabled.disabled = true;
        disabled.disabled_description = "no body download in this configuration";
        let mut pipeline = Pipeline::new(vec![
            tracking_stage(StageId::Headers, calls.clone()),
            disabled,
            tracking_stage(StageId::Senders, calls.clone()),
        ]);

        pipeline.run(&kv).unwrap();
        assert_eq!(*calls.borrow(), vec!["exec:Headers", "exec:Senders"]);
    }

    #[test]
    fn interrupted_stage_runs_first() {
        let kv = MemKv::new();
        set_execution_progress(&kv, 5);
        // Senders was interrupted mid-run
        let mut tx = kv.begin_mut().unwrap();
        save_stage_progress(&mut tx, StageId::Senders, 2, &[0x01, 0xfe]).unwrap();
        TxMut::commit(tx).unwrap();

        let calls: Calls = Default::default();
        let mut pipeline = three_stage_pipeline(&calls);
        pipeline.run(&kv).unwrap();

        // the interrupted stage completes first, then the sequence restarts
        assert_eq!(
            *calls.borrow(),
            vec!["exec:Senders", "exec:Headers", "exec:Bodies", "exec:Senders"]
        );
    }

    #[test]
    fn unwind_drains_lifo_and_filters_by_progress() {
        let kv = MemKv::new();
        set_execution_progress(&kv, 10);
        let calls: Calls = Default::default();
        let mut pipeline = three_stage_pipeline(&calls);
        pipeline.run(&kv).unwrap();
        calls.borrow_mut().clear();

        // move Senders back so its entry is filtered as a no-op
        let mut tx = kv.begin_mut().unwrap();
        save_stage_progress(&mut tx, StageId::Senders, 2, &[]).unwrap();
        TxMut::commit(tx).unwrap();

        pipeline.unwind_to(&kv, 4).unwrap();
        pipeline.run(&kv).unwrap();

        // LIFO: Senders first (skipped silently), then Bodies, then Headers
        assert_eq!(*calls.borrow(), vec!["unwind:Bodies", "unwind:Headers"]);
        let tx = kv.begin().unwrap();
        assert_eq!(get_stage_progress(&tx, StageId::Headers).unwrap().0, 4);
        assert_eq!(get_stage_progress(&tx, StageId::Bodies).unwrap().0, 4);
        assert_eq!(get_stage_progress(&tx, StageId::Senders).unwrap().0, 2);
        assert_eq!(crate::get_stage_unwind(&tx, StageId::Headers).unwrap(), None);

        // the next run rolls everything forward again
        calls.borrow_mut().clear();
        pipeline.run(&kv).unwrap();
        assert!(pipeline.is_done());
        let tx = kv.begin().unwrap();
        assert_eq!(get_stage_progress(&tx, StageId::Headers).unwrap().0, 10);
    }

    #[test]
    fn interrupted_unwind_resumes_before_the_loop() {
        let kv = MemKv::new();
        set_execution_progress(&kv, 6);
        let calls: Calls = Default::default();
        let mut pipeline = three_stage_pipeline(&calls);
        pipeline.run(&kv).unwrap();
        calls.borrow_mut().clear();

        // an unwind of Bodies was interrupted and left resume data behind
        let mut tx = kv.begin_mut().unwrap();
        save_stage_unwind(&mut tx, StageId::Bodies, 1, &[0x42]).unwrap();
        TxMut::commit(tx).unwrap();

        let mut pipeline = three_stage_pipeline(&calls);
        pipeline.run(&kv).unwrap();
        assert_eq!(calls.borrow()[0], "unwind:Bodies");
    }

    #[test]
    fn unknown_stage_id_errors() {
        let calls: Calls = Default::default();
        let mut pipeline = Pipeline::new(vec![tracking_stage(StageId::Headers, calls)]);
        let err = pipeline.set_current_stage(StageId::TxPool).unwrap_err();
        assert_eq!(err.to_string(), "stage not found with id: 10");
    }

    #[test]
    fn stage_error_aborts_without_advancing() {
        let kv = MemKv::new();
        set_execution_progress(&kv, 2);
        let calls: Calls = Default::default();
        let failing = Stage::new(
            StageId::Bodies,
            "failing",
            Box::new(|_s: &mut StageState, _db: &MemKv| {
                Err(StageError::HeaderNotFound(99))
            }),
        );
        let mut pipeline = Pipeline::new(vec![
            tracking_stage(StageId::Headers, calls.clone()),
            failing,
            tracking_stage(StageId::Senders, calls.clone()),
        ]);

        let err = pipeline.run(&kv).unwrap_err();
        assert!(matches!(err, StageError::HeaderNotFound(99)));
        // the failing stage did not advance; later stages never ran
        assert_eq!(*calls.borrow(), vec!["exec:Headers"]);
        let tx = kv.begin().unwrap();
        assert_eq!(get_stage_progress(&tx, StageId::Bodies).unwrap(), (0, Vec::new()));
    }
}
