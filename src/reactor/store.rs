use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use super::instruction::{Instruction, InstructionState, InstructionStatus};

/// Durable instruction store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No instruction exists for the given identity.
    #[error("instruction {id} from {instructor_id} not found")]
    NotFound { id: i64, instructor_id: String },
    /// The backing store rejected the operation.
    #[error("instruction store failure: {0}")]
    Backend(String),
}

/// Durable store the decision loop and the periodic jobs coordinate through.
///
/// The compare-and-set operation is the only cross-process and cross-thread
/// coordination primitive in the engine. Implementations must perform the
/// state comparison and the write as one atomic conditional operation (for a
/// relational backend, `UPDATE ... WHERE id = ? AND state = ?`), never as a
/// read followed by a write.
pub trait InstructionStore: Send + Sync {
    /// Persists a new instruction, returning the assigned id.
    ///
    /// An instruction with a zero id receives a generated one; non-zero ids
    /// (remote instructions) are stored as given.
    fn store_instruction(&self, instruction: Instruction) -> Result<i64, StoreError>;

    /// Looks up one instruction by identity.
    fn instruction(
        &self,
        id: i64,
        instructor_id: &str,
    ) -> Result<Option<Instruction>, StoreError>;

    /// Unconditionally replaces the status of an instruction.
    fn store_instruction_status(
        &self,
        id: i64,
        instructor_id: &str,
        status: InstructionStatus,
    ) -> Result<(), StoreError>;

    /// Replaces the status only if the current primary state equals
    /// `expected`. Returns `false`, leaving the stored status unchanged,
    /// when the comparison fails.
    fn compare_and_store_instruction_status(
        &self,
        id: i64,
        instructor_id: &str,
        expected: InstructionState,
        status: InstructionStatus,
    ) -> Result<bool, StoreError>;

    /// All instructions currently in `state`, in stable id order.
    fn instructions_for_state(
        &self,
        state: InstructionState,
    ) -> Result<Vec<Instruction>, StoreError>;

    /// All instructions whose primary state differs from their acknowledged
    /// state.
    fn instructions_for_acknowledgement(&self) -> Result<Vec<Instruction>, StoreError>;

    /// Deletes terminal, acknowledged instructions whose status is older
    /// than `hours` before `now`. Returns the number removed.
    fn delete_handled_instructions_older_than(
        &self,
        now: DateTime<Utc>,
        hours: u32,
    ) -> Result<usize, StoreError>;
}

/// In-memory [`InstructionStore`].
///
/// The CAS compares and writes under a single lock acquisition, which makes
/// it a true conditional write within the process.
#[derive(Debug, Default)]
pub struct MemoryInstructionStore {
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    next_id: i64,
    instructions: HashMap<(i64, String), Instruction>,
}

impl MemoryInstructionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, StoreInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".to_string()))
    }
}

impl InstructionStore for MemoryInstructionStore {
    fn store_instruction(&self, instruction: Instruction) -> Result<i64, StoreError> {
        let mut inner = self.locked()?;
        let id = if instruction.id == 0 {
            inner.next_id += 1;
            inner.next_id
        } else {
            instruction.id
        };
        let stored = instruction.with_id(id);
        inner
            .instructions
            .insert((id, stored.instructor_id.clone()), stored);
        Ok(id)
    }

    fn instruction(
        &self,
        id: i64,
        instructor_id: &str,
    ) -> Result<Option<Instruction>, StoreError> {
        let inner = self.locked()?;
        Ok(inner
            .instructions
            .get(&(id, instructor_id.to_string()))
            .cloned())
    }

    fn store_instruction_status(
        &self,
        id: i64,
        instructor_id: &str,
        status: InstructionStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.locked()?;
        let entry = inner
            .instructions
            .get_mut(&(id, instructor_id.to_string()))
            .ok_or_else(|| StoreError::NotFound {
                id,
                instructor_id: instructor_id.to_string(),
            })?;
        entry.status = status;
        Ok(())
    }

    fn compare_and_store_instruction_status(
        &self,
        id: i64,
        instructor_id: &str,
        expected: InstructionState,
        status: InstructionStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.locked()?;
        let entry = inner
            .instructions
            .get_mut(&(id, instructor_id.to_string()))
            .ok_or_else(|| StoreError::NotFound {
                id,
                instructor_id: instructor_id.to_string(),
            })?;
        if entry.status.state != expected {
            return Ok(false);
        }
        entry.status = status;
        Ok(true)
    }

    fn instructions_for_state(
        &self,
        state: InstructionState,
    ) -> Result<Vec<Instruction>, StoreError> {
        let inner = self.locked()?;
        let mut matches: Vec<Instruction> = inner
            .instructions
            .values()
            .filter(|i| i.status.state == state)
            .cloned()
            .collect();
        matches.sort_by_key(|i| i.id);
        Ok(matches)
    }

    fn instructions_for_acknowledgement(&self) -> Result<Vec<Instruction>, StoreError> {
        let inner = self.locked()?;
        let mut matches: Vec<Instruction> = inner
            .instructions
            .values()
            .filter(|i| i.status.acknowledged_state != Some(i.status.state))
            .cloned()
            .collect();
        matches.sort_by_key(|i| i.id);
        Ok(matches)
    }

    fn delete_handled_instructions_older_than(
        &self,
        now: DateTime<Utc>,
        hours: u32,
    ) -> Result<usize, StoreError> {
        let mut inner = self.locked()?;
        let cutoff = now - Duration::hours(i64::from(hours));
        let before = inner.instructions.len();
        inner.instructions.retain(|_, i| {
            !(i.status.state.is_terminal()
                && i.status.acknowledged_state == Some(i.status.state)
                && i.status.status_date < cutoff)
        });
        Ok(before - inner.instructions.len())
    }
}
