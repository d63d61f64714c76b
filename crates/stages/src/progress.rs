//! Persisted stage progress and unwind rows.
//!
//! Both buckets share one value schema: `be8(block) ++ stage data`. Progress
//! rows always exist once a stage ran; unwind rows exist only while an
//! unwind is pending.

use crate::{StageError, StageId};
use stratus_etl::Putter;
use stratus_kv::{tables, Tx};

fn encode(block: u64, stage_data: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(8 + stage_data.len());
    value.extend_from_slice(&block.to_be_bytes());
    value.extend_from_slice(stage_data);
    value
}

fn decode(value: &[u8]) -> Result<(u64, Vec<u8>), StageError> {
    let block: [u8; 8] = value.get(..8).ok_or(StageError::CorruptProgress)?.try_into()
        .map_err(|_| StageError::CorruptProgress)?;
    Ok((u64::from_be_bytes(block), value[8..].to_vec()))
}

/// Reads a stage's progress; `(0, empty)` if the stage never ran.
pub fn get_stage_progress<T: Tx>(tx: &T, stage: StageId) -> Result<(u64, Vec<u8>), StageError> {
    match tx.get(tables::SYNC_STAGE_PROGRESS, &[stage.as_u8()])? {
        Some(value) => decode(&value),
        None => Ok((0, Vec::new())),
    }
}

/// Writes a stage's progress in the caller's transaction.
pub fn save_stage_progress(
    putter: &mut dyn Putter,
    stage: StageId,
    block: u64,
    stage_data: &[u8],
) -> Result<(), stratus_kv::KvError> {
    putter.put(tables::SYNC_STAGE_PROGRESS, &[stage.as_u8()], &encode(block, stage_data))
}

/// Reads a pending unwind row; `None` when no unwind is pending.
pub fn get_stage_unwind<T: Tx>(
    tx: &T,
    stage: StageId,
) -> Result<Option<(u64, Vec<u8>)>, StageError> {
    match tx.get(tables::SYNC_STAGE_UNWIND, &[stage.as_u8()])? {
        Some(value) => Ok(Some(decode(&value)?)),
        None => Ok(None),
    }
}

/// Writes a pending unwind row in the caller's transaction.
pub fn save_stage_unwind(
    putter: &mut dyn Putter,
    stage: StageId,
    unwind_point: u64,
    stage_data: &[u8],
) -> Result<(), stratus_kv::KvError> {
    putter.put(tables::SYNC_STAGE_UNWIND, &[stage.as_u8()], &encode(unwind_point, stage_data))
}

/// Consumes a pending unwind row in the caller's transaction.
pub fn delete_stage_unwind(
    putter: &mut dyn Putter,
    stage: StageId,
) -> Result<(), stratus_kv::KvError> {
    putter.delete(tables::SYNC_STAGE_UNWIND, &[stage.as_u8()])
}
