use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use super::instruction::{Instruction, InstructionState, InstructionStatus};

/// Result of a handler claiming an instruction.
///
/// Plain handlers report only the resulting state; feedback-capable handlers
/// report a complete replacement status. Both kinds sit behind the single
/// [`InstructionHandler::process`] entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    State(InstructionState),
    Status(InstructionStatus),
}

/// Failure raised by a handler while processing an instruction.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Pluggable executor for instructions of specific topics.
pub trait InstructionHandler: Send + Sync {
    /// Whether this handler can process instructions of `topic`.
    fn handles_topic(&self, topic: &str) -> bool;

    /// Attempts to process the instruction.
    ///
    /// `Ok(None)` means the handler did not claim the instruction and
    /// dispatch continues with the next handler in order.
    fn process(&self, instruction: &Instruction) -> Result<Option<HandlerOutcome>, HandlerError>;
}

/// Dispatch failure, surfaced to the execution job which decides recovery.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A handler failed while processing the instruction. The message is the
    /// root cause of the handler's error chain.
    #[error("handler failed processing instruction {instruction_id}: {message}")]
    Handler { instruction_id: i64, message: String },
    /// A handler exceeded the configured call timeout.
    #[error("handler timed out after {timeout:?} processing instruction {instruction_id}")]
    HandlerTimeout {
        instruction_id: i64,
        timeout: Duration,
    },
}

/// Dispatches one instruction through the configured handlers, in order.
///
/// Dispatch is serialized process-wide: concurrent callers are safe, but at
/// most one handler call is in flight at a time, so two handlers never race
/// the same hardware control.
pub struct InstructionExecutionService {
    handlers: Vec<Arc<dyn InstructionHandler>>,
    dispatch_lock: Mutex<()>,
    handler_timeout: Option<Duration>,
}

impl InstructionExecutionService {
    pub fn new(handlers: Vec<Arc<dyn InstructionHandler>>) -> Self {
        Self {
            handlers,
            dispatch_lock: Mutex::new(()),
            handler_timeout: None,
        }
    }

    /// Bounds each handler call; a handler still running when the timeout
    /// elapses fails the dispatch instead of stalling the cycle.
    ///
    /// The timed-out call keeps running on its detached worker thread and
    /// its eventual result is discarded. Dispatch serialization does not
    /// extend to that orphaned call, so a later dispatch can overlap with it
    /// on the same control; size the timeout well above the slowest expected
    /// handler.
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Executes one instruction through the ordered handler chain.
    ///
    /// Returns `Ok(None)` when no handler claimed the instruction (it stays
    /// `Received` and is retried next cycle). The first handler producing a
    /// status that differs from the instruction's current status wins and
    /// iteration stops. A handler failure is logged with its root cause and
    /// re-raised; the caller decides how to recover.
    pub fn execute_instruction(
        &self,
        instruction: &Instruction,
        now: DateTime<Utc>,
    ) -> Result<Option<InstructionStatus>, ExecutionError> {
        let _guard = self
            .dispatch_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if self.handlers.is_empty() {
            debug!(
                instruction_id = instruction.id,
                topic = %instruction.topic,
                "no instruction handlers configured"
            );
            return Ok(None);
        }
        for handler in &self.handlers {
            if !handler.handles_topic(&instruction.topic) {
                continue;
            }
            let Some(outcome) = self.call_handler(handler, instruction)? else {
                continue;
            };
            let status = match outcome {
                HandlerOutcome::State(state) => instruction.status.with_state(state, now),
                HandlerOutcome::Status(status) => status,
            };
            if status != instruction.status {
                return Ok(Some(status));
            }
        }
        Ok(None)
    }

    fn call_handler(
        &self,
        handler: &Arc<dyn InstructionHandler>,
        instruction: &Instruction,
    ) -> Result<Option<HandlerOutcome>, ExecutionError> {
        let result = match self.handler_timeout {
            None => handler.process(instruction),
            Some(timeout) => {
                let (tx, rx) = mpsc::channel();
                let handler = Arc::clone(handler);
                let owned = instruction.clone();
                thread::spawn(move || {
                    let _ = tx.send(handler.process(&owned));
                });
                match rx.recv_timeout(timeout) {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            instruction_id = instruction.id,
                            topic = %instruction.topic,
                            ?timeout,
                            "handler call timed out"
                        );
                        return Err(ExecutionError::HandlerTimeout {
                            instruction_id: instruction.id,
                            timeout,
                        });
                    }
                }
            }
        };
        result.map_err(|e| {
            let cause = root_cause(&e);
            warn!(
                instruction_id = instruction.id,
                topic = %instruction.topic,
                error = %cause,
                "handler failed processing instruction"
            );
            ExecutionError::Handler {
                instruction_id: instruction.id,
                message: cause.to_string(),
            }
        })
    }
}

/// Walks an error chain to its innermost source.
fn root_cause<'a>(err: &'a (dyn std::error::Error + 'static)) -> &'a (dyn std::error::Error + 'static) {
    let mut current = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current
}
