use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::execution::InstructionExecutionService;
use super::instruction::{
    Instruction, InstructionState, InstructionStatus, error_result_parameters,
};
use super::store::{InstructionStore, StoreError};

/// Machine-readable code attached when an instruction exceeds its age limit.
pub const ERROR_CODE_EXPIRED: &str = "EXPIRED";

/// Extension point for resolving instructions stuck in `Executing`, for
/// example after a crash between claim and commit.
///
/// Without a policy the job only declines stuck instructions once they
/// exceed the age limit; a deployment wanting earlier reclaim (say back to
/// `Received` for retry) installs its own rule with
/// [`InstructionExecutionJob::with_stuck_policy`].
pub trait StuckInstructionPolicy: Send + Sync {
    /// Returns a replacement status to commit for the stuck instruction, or
    /// `None` to leave it alone this cycle.
    fn resolve(&self, instruction: &Instruction, now: DateTime<Utc>) -> Option<InstructionStatus>;
}

/// Periodic driver that claims `Received` instructions and dispatches them.
///
/// Each instruction goes through a two-phase commit against the store: a CAS
/// claim (`Received -> Executing`), the dispatch, and a best-effort CAS
/// commit (`Executing -> result`, or back to the original `Received` status
/// for retry). The store's CAS is the only coordination with other runners;
/// a failed claim means another runner took the instruction.
pub struct InstructionExecutionJob {
    store: Arc<dyn InstructionStore>,
    execution: Arc<InstructionExecutionService>,
    /// Hours an instruction may remain unhandled before it is declined
    /// outright.
    received_hour_limit: u32,
    stuck_policy: Option<Arc<dyn StuckInstructionPolicy>>,
}

impl InstructionExecutionJob {
    pub fn new(store: Arc<dyn InstructionStore>, execution: Arc<InstructionExecutionService>) -> Self {
        Self {
            store,
            execution,
            received_hour_limit: 24,
            stuck_policy: None,
        }
    }

    pub fn with_received_hour_limit(mut self, hours: u32) -> Self {
        self.received_hour_limit = hours;
        self
    }

    pub fn with_stuck_policy(mut self, policy: Arc<dyn StuckInstructionPolicy>) -> Self {
        self.stuck_policy = Some(policy);
        self
    }

    /// Runs one polling cycle.
    ///
    /// A dispatch failure for one instruction reverts it for retry and never
    /// blocks the rest of the batch; only store failures abort the cycle.
    pub fn run(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let received = self.store.instructions_for_state(InstructionState::Received)?;
        for instruction in &received {
            self.process_one(instruction, now)?;
        }
        self.sweep_executing(now)
    }

    fn process_one(&self, instruction: &Instruction, now: DateTime<Utc>) -> Result<(), StoreError> {
        let claim = instruction
            .status
            .with_state(InstructionState::Executing, now);
        let claimed = self.store.compare_and_store_instruction_status(
            instruction.id,
            &instruction.instructor_id,
            InstructionState::Received,
            claim,
        )?;
        if !claimed {
            debug!(
                instruction_id = instruction.id,
                "instruction already claimed by another runner"
            );
            return Ok(());
        }

        let result = match self.execution.execute_instruction(instruction, now) {
            Ok(Some(status)) => status,
            Ok(None) => self.unhandled_status(instruction, now),
            Err(e) => {
                warn!(
                    instruction_id = instruction.id,
                    topic = %instruction.topic,
                    error = %e,
                    "instruction execution failed, reverting for retry"
                );
                instruction.status.clone()
            }
        };

        // best effort: a failed commit means the state diverged concurrently
        let committed = self.store.compare_and_store_instruction_status(
            instruction.id,
            &instruction.instructor_id,
            InstructionState::Executing,
            result,
        )?;
        if !committed {
            debug!(
                instruction_id = instruction.id,
                "instruction status diverged before commit"
            );
        }
        Ok(())
    }

    /// Status to commit for an instruction no handler claimed: the original
    /// `Received` status for retry, or a terminal `Declined` once the age
    /// limit is exceeded.
    fn unhandled_status(&self, instruction: &Instruction, now: DateTime<Utc>) -> InstructionStatus {
        self.expired_status(instruction, now)
            .unwrap_or_else(|| instruction.status.clone())
    }

    /// Terminal `Declined` status once the instruction is older than the age
    /// limit, or `None` while it is still within it.
    fn expired_status(
        &self,
        instruction: &Instruction,
        now: DateTime<Utc>,
    ) -> Option<InstructionStatus> {
        if now - instruction.instruction_date
            <= Duration::hours(i64::from(self.received_hour_limit))
        {
            return None;
        }
        info!(
            instruction_id = instruction.id,
            topic = %instruction.topic,
            hours = self.received_hour_limit,
            "declining instruction unhandled past age limit"
        );
        let message = format!(
            "Not handled within {} hours of receiving",
            self.received_hour_limit
        );
        Some(
            instruction
                .status
                .with_state(InstructionState::Declined, now)
                .with_result_parameters(error_result_parameters(&message, ERROR_CODE_EXPIRED)),
        )
    }

    /// Resolves instructions left in `Executing`, for example by a runner
    /// that crashed between claim and commit. The stuck policy gets first
    /// say; otherwise an instruction past the age limit is declined, the
    /// same expiry applied to unhandled `Received` instructions.
    fn sweep_executing(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        for instruction in self.store.instructions_for_state(InstructionState::Executing)? {
            let resolved = self
                .stuck_policy
                .as_ref()
                .and_then(|policy| policy.resolve(&instruction, now));
            let Some(status) = resolved.or_else(|| self.expired_status(&instruction, now)) else {
                continue;
            };
            let committed = self.store.compare_and_store_instruction_status(
                instruction.id,
                &instruction.instructor_id,
                InstructionState::Executing,
                status,
            )?;
            if !committed {
                debug!(
                    instruction_id = instruction.id,
                    "stuck instruction resolved concurrently"
                );
            }
        }
        Ok(())
    }
}

/// Upstream collaborator receiving instruction status acknowledgements.
pub trait AcknowledgementService: Send + Sync {
    /// Pushes the batch upstream. An error fails the whole batch; nothing in
    /// it is considered acknowledged.
    fn acknowledge(&self, instructions: &[Instruction]) -> Result<(), AckError>;
}

/// Upstream acknowledgement failure.
#[derive(Debug, Error)]
#[error("acknowledgement upload failed: {message}")]
pub struct AckError {
    pub message: String,
}

impl AckError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Periodic driver that reports instruction states upstream.
///
/// Polls for instructions whose primary state differs from the acknowledged
/// state and pushes them as one batch. An upstream error aborts the whole
/// batch for the cycle with no partial bookkeeping; the full batch is
/// retried next cycle.
pub struct InstructionAcknowledgeJob {
    store: Arc<dyn InstructionStore>,
    upstream: Arc<dyn AcknowledgementService>,
}

impl InstructionAcknowledgeJob {
    pub fn new(store: Arc<dyn InstructionStore>, upstream: Arc<dyn AcknowledgementService>) -> Self {
        Self { store, upstream }
    }

    /// Runs one polling cycle.
    pub fn run(&self, _now: DateTime<Utc>) -> Result<(), StoreError> {
        let pending = self.store.instructions_for_acknowledgement()?;
        if pending.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.upstream.acknowledge(&pending) {
            warn!(
                count = pending.len(),
                error = %e,
                "acknowledgement batch failed, retrying next cycle"
            );
            return Ok(());
        }
        for instruction in &pending {
            let status = instruction
                .status
                .with_acknowledged_state(instruction.status.state);
            self.store.store_instruction_status(
                instruction.id,
                &instruction.instructor_id,
                status,
            )?;
        }
        debug!(count = pending.len(), "acknowledged instruction statuses");
        Ok(())
    }
}

/// Periodic driver that purges handled, acknowledged instructions.
pub struct InstructionCleanupJob {
    store: Arc<dyn InstructionStore>,
    purge_hours: u32,
}

impl InstructionCleanupJob {
    pub fn new(store: Arc<dyn InstructionStore>, purge_hours: u32) -> Self {
        Self { store, purge_hours }
    }

    /// Runs one purge cycle, returning the number of instructions removed.
    pub fn run(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self
            .store
            .delete_handled_instructions_older_than(now, self.purge_hours)?;
        if removed > 0 {
            info!(count = removed, "purged handled instructions");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::execution::{HandlerError, HandlerOutcome, InstructionHandler};
    use crate::reactor::instruction::{
        ERROR_CODE_RESULT_PARAM, MESSAGE_RESULT_PARAM, TOPIC_SHED_LOAD,
    };
    use crate::reactor::store::MemoryInstructionStore;
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct ScriptedHandler {
        outcome: Result<Option<HandlerOutcome>, String>,
        processed: Mutex<Vec<i64>>,
    }

    impl ScriptedHandler {
        fn completing() -> Self {
            Self {
                outcome: Ok(Some(HandlerOutcome::State(InstructionState::Completed))),
                processed: Mutex::new(Vec::new()),
            }
        }

        fn ignoring() -> Self {
            Self {
                outcome: Ok(None),
                processed: Mutex::new(Vec::new()),
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                outcome: Err(message.to_string()),
                processed: Mutex::new(Vec::new()),
            }
        }
    }

    impl InstructionHandler for ScriptedHandler {
        fn handles_topic(&self, topic: &str) -> bool {
            topic == TOPIC_SHED_LOAD
        }

        fn process(
            &self,
            instruction: &Instruction,
        ) -> Result<Option<HandlerOutcome>, HandlerError> {
            self.processed.lock().unwrap().push(instruction.id);
            match &self.outcome {
                Ok(outcome) => Ok(outcome.clone()),
                Err(message) => Err(HandlerError::new(message.clone())),
            }
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn store_received(
        store: &MemoryInstructionStore,
        instruction_date: DateTime<Utc>,
    ) -> i64 {
        let instr = Instruction::local(
            TOPIC_SHED_LOAD,
            instruction_date,
            vec![("/switch/1".into(), "500".into())],
        );
        store.store_instruction(instr).unwrap()
    }

    fn job_with(
        store: Arc<MemoryInstructionStore>,
        handler: Arc<ScriptedHandler>,
    ) -> InstructionExecutionJob {
        let service = Arc::new(InstructionExecutionService::new(vec![handler]));
        InstructionExecutionJob::new(store, service)
    }

    #[test]
    fn handled_instruction_commits_result_status() {
        let store = Arc::new(MemoryInstructionStore::new());
        let id = store_received(&store, now());
        let handler = Arc::new(ScriptedHandler::completing());
        let job = job_with(store.clone(), handler.clone());

        job.run(now()).unwrap();

        let stored = store.instruction(id, "LOCAL").unwrap().unwrap();
        assert_eq!(stored.status.state, InstructionState::Completed);
        assert_eq!(*handler.processed.lock().unwrap(), vec![id]);
    }

    #[test]
    fn unhandled_instruction_reverts_to_received() {
        let store = Arc::new(MemoryInstructionStore::new());
        let id = store_received(&store, now());
        let job = job_with(store.clone(), Arc::new(ScriptedHandler::ignoring()));

        job.run(now()).unwrap();

        let stored = store.instruction(id, "LOCAL").unwrap().unwrap();
        assert_eq!(stored.status.state, InstructionState::Received);
    }

    #[test]
    fn failed_execution_reverts_and_does_not_block_batch() {
        let store = Arc::new(MemoryInstructionStore::new());
        let first = store_received(&store, now());
        let second = store_received(&store, now());
        let handler = Arc::new(ScriptedHandler::failing("relay offline"));
        let job = job_with(store.clone(), handler.clone());

        job.run(now()).unwrap();

        // both instructions were attempted despite the first failing
        assert_eq!(*handler.processed.lock().unwrap(), vec![first, second]);
        for id in [first, second] {
            let stored = store.instruction(id, "LOCAL").unwrap().unwrap();
            assert_eq!(stored.status.state, InstructionState::Received);
        }
    }

    #[test]
    fn expired_instruction_is_declined_exactly_once() {
        let store = Arc::new(MemoryInstructionStore::new());
        let id = store_received(&store, now() - Duration::hours(25));
        let handler = Arc::new(ScriptedHandler::ignoring());
        let job = job_with(store.clone(), handler.clone());

        job.run(now()).unwrap();

        let stored = store.instruction(id, "LOCAL").unwrap().unwrap();
        assert_eq!(stored.status.state, InstructionState::Declined);
        assert_eq!(
            stored
                .status
                .result_parameters
                .get(ERROR_CODE_RESULT_PARAM)
                .map(String::as_str),
            Some(ERROR_CODE_EXPIRED)
        );
        assert!(
            stored
                .status
                .result_parameters
                .contains_key(MESSAGE_RESULT_PARAM)
        );

        // later cycles are no-ops since the state is no longer Received
        job.run(now() + Duration::minutes(5)).unwrap();
        assert_eq!(handler.processed.lock().unwrap().len(), 1);
        let stored = store.instruction(id, "LOCAL").unwrap().unwrap();
        assert_eq!(stored.status.state, InstructionState::Declined);
    }

    #[test]
    fn instruction_just_inside_age_limit_is_retried() {
        let store = Arc::new(MemoryInstructionStore::new());
        let id = store_received(&store, now() - Duration::hours(23));
        let job = job_with(store.clone(), Arc::new(ScriptedHandler::ignoring()));

        job.run(now()).unwrap();

        let stored = store.instruction(id, "LOCAL").unwrap().unwrap();
        assert_eq!(stored.status.state, InstructionState::Received);
    }

    #[test]
    fn claimed_instruction_is_skipped() {
        let store = Arc::new(MemoryInstructionStore::new());
        let id = store_received(&store, now());
        // another runner claims between the poll and our CAS
        let instr = store.instruction(id, "LOCAL").unwrap().unwrap();
        store
            .store_instruction_status(
                id,
                "LOCAL",
                instr.status.with_state(InstructionState::Executing, now()),
            )
            .unwrap();

        let handler = Arc::new(ScriptedHandler::completing());
        let job = job_with(store.clone(), handler.clone());
        // poll sees nothing Received, so nothing is dispatched
        job.run(now()).unwrap();
        assert!(handler.processed.lock().unwrap().is_empty());
    }

    #[test]
    fn stuck_policy_resolves_executing_instructions() {
        struct DeclineStuck;
        impl StuckInstructionPolicy for DeclineStuck {
            fn resolve(
                &self,
                instruction: &Instruction,
                now: DateTime<Utc>,
            ) -> Option<InstructionStatus> {
                Some(
                    instruction
                        .status
                        .with_state(InstructionState::Declined, now),
                )
            }
        }

        let store = Arc::new(MemoryInstructionStore::new());
        let id = store_received(&store, now());
        let instr = store.instruction(id, "LOCAL").unwrap().unwrap();
        store
            .store_instruction_status(
                id,
                "LOCAL",
                instr.status.with_state(InstructionState::Executing, now()),
            )
            .unwrap();

        let job = job_with(store.clone(), Arc::new(ScriptedHandler::ignoring()))
            .with_stuck_policy(Arc::new(DeclineStuck));
        job.run(now()).unwrap();

        let stored = store.instruction(id, "LOCAL").unwrap().unwrap();
        assert_eq!(stored.status.state, InstructionState::Declined);
    }

    #[test]
    fn expired_executing_instruction_is_declined_without_a_policy() {
        let store = Arc::new(MemoryInstructionStore::new());
        let claimed_at = now() - Duration::hours(25);
        let id = store_received(&store, claimed_at);
        // a runner claimed the instruction and crashed before committing
        let instr = store.instruction(id, "LOCAL").unwrap().unwrap();
        store
            .store_instruction_status(
                id,
                "LOCAL",
                instr
                    .status
                    .with_state(InstructionState::Executing, claimed_at),
            )
            .unwrap();

        let job = job_with(store.clone(), Arc::new(ScriptedHandler::completing()));
        job.run(now()).unwrap();

        let stored = store.instruction(id, "LOCAL").unwrap().unwrap();
        assert_eq!(stored.status.state, InstructionState::Declined);
        assert_eq!(
            stored
                .status
                .result_parameters
                .get(ERROR_CODE_RESULT_PARAM)
                .map(String::as_str),
            Some(ERROR_CODE_EXPIRED)
        );
        assert!(
            stored
                .status
                .result_parameters
                .contains_key(MESSAGE_RESULT_PARAM)
        );

        // terminal now, so a second sweep changes nothing
        job.run(now() + Duration::minutes(5)).unwrap();
        let stored = store.instruction(id, "LOCAL").unwrap().unwrap();
        assert_eq!(stored.status.state, InstructionState::Declined);
    }

    #[test]
    fn executing_instruction_inside_age_limit_is_left_alone() {
        let store = Arc::new(MemoryInstructionStore::new());
        let id = store_received(&store, now() - Duration::hours(23));
        let instr = store.instruction(id, "LOCAL").unwrap().unwrap();
        store
            .store_instruction_status(
                id,
                "LOCAL",
                instr.status.with_state(InstructionState::Executing, now()),
            )
            .unwrap();

        let job = job_with(store.clone(), Arc::new(ScriptedHandler::completing()));
        job.run(now()).unwrap();

        let stored = store.instruction(id, "LOCAL").unwrap().unwrap();
        assert_eq!(stored.status.state, InstructionState::Executing);
    }

    struct RecordingAck {
        fail: bool,
        batches: Mutex<Vec<usize>>,
    }

    impl AcknowledgementService for RecordingAck {
        fn acknowledge(&self, instructions: &[Instruction]) -> Result<(), AckError> {
            self.batches.lock().unwrap().push(instructions.len());
            if self.fail {
                Err(AckError::new("upstream unavailable"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn acknowledge_job_stores_ack_state_for_whole_batch() {
        let store = Arc::new(MemoryInstructionStore::new());
        let a = store_received(&store, now());
        let b = store_received(&store, now());
        let upstream = Arc::new(RecordingAck {
            fail: false,
            batches: Mutex::new(Vec::new()),
        });
        let job = InstructionAcknowledgeJob::new(store.clone(), upstream.clone());

        job.run(now()).unwrap();

        assert_eq!(*upstream.batches.lock().unwrap(), vec![2]);
        for id in [a, b] {
            let stored = store.instruction(id, "LOCAL").unwrap().unwrap();
            assert_eq!(
                stored.status.acknowledged_state,
                Some(InstructionState::Received)
            );
        }
        // everything acknowledged, next cycle has nothing to push
        job.run(now()).unwrap();
        assert_eq!(upstream.batches.lock().unwrap().len(), 1);
    }

    #[test]
    fn acknowledge_job_aborts_batch_on_upstream_error() {
        let store = Arc::new(MemoryInstructionStore::new());
        let id = store_received(&store, now());
        let upstream = Arc::new(RecordingAck {
            fail: true,
            batches: Mutex::new(Vec::new()),
        });
        let job = InstructionAcknowledgeJob::new(store.clone(), upstream.clone());

        job.run(now()).unwrap();

        let stored = store.instruction(id, "LOCAL").unwrap().unwrap();
        assert_eq!(stored.status.acknowledged_state, None);
        // retried in full next cycle
        job.run(now()).unwrap();
        assert_eq!(*upstream.batches.lock().unwrap(), vec![1, 1]);
    }

    #[test]
    fn cleanup_job_reports_removed_count() {
        let store = Arc::new(MemoryInstructionStore::new());
        let id = store_received(&store, now());
        let instr = store.instruction(id, "LOCAL").unwrap().unwrap();
        store
            .store_instruction_status(
                id,
                "LOCAL",
                instr
                    .status
                    .with_state(InstructionState::Completed, now() - Duration::hours(100))
                    .with_acknowledged_state(InstructionState::Completed),
            )
            .unwrap();

        let job = InstructionCleanupJob::new(store.clone(), 72);
        assert_eq!(job.run(now()).unwrap(), 1);
        assert!(store.instruction(id, "LOCAL").unwrap().is_none());
    }
}
