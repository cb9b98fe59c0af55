use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

/// Topic for adjusting a single control parameter value.
pub const TOPIC_SET_CONTROL_PARAMETER: &str = "SetControlParameter";
/// Topic for balancing local generation against demand.
pub const TOPIC_DEMAND_BALANCE_GENERATION: &str = "DemandBalanceGeneration";
/// Topic for shedding or releasing electrical load.
///
/// The parameter key is a control id and the value the requested shed watts
/// as a decimal string; a zero or negative value requests the limit be
/// removed.
pub const TOPIC_SHED_LOAD: &str = "ShedLoad";
/// Topic for changing a device operating state.
pub const TOPIC_SET_OPERATING_STATE: &str = "SetOperatingState";
/// Topic for delivering an opaque signal to a device.
pub const TOPIC_SIGNAL: &str = "Signal";

/// Instructor id for instructions generated on this node.
pub const LOCAL_INSTRUCTOR_ID: &str = "LOCAL";

/// Result parameter key carrying a human-readable failure message.
pub const MESSAGE_RESULT_PARAM: &str = "message";
/// Result parameter key carrying a machine-readable failure code.
pub const ERROR_CODE_RESULT_PARAM: &str = "code";

/// Lifecycle state of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionState {
    /// Stored but not yet claimed by an execution job.
    Received,
    /// Claimed; a dispatch attempt is in flight or was interrupted.
    Executing,
    /// Terminal: refused or expired.
    Declined,
    /// Terminal: executed successfully.
    Completed,
}

impl InstructionState {
    /// Whether the state machine permits moving to `next`.
    ///
    /// `Received -> Executing -> {Completed, Declined}`, with the explicit
    /// `Executing -> Received` back-edge for failed or unclaimed execution.
    pub fn can_transition_to(self, next: InstructionState) -> bool {
        use InstructionState::*;
        matches!(
            (self, next),
            (Received, Executing)
                | (Executing, Completed)
                | (Executing, Declined)
                | (Executing, Received)
        )
    }

    /// Whether no further primary-state transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, InstructionState::Completed | InstructionState::Declined)
    }
}

impl fmt::Display for InstructionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstructionState::Received => "Received",
            InstructionState::Executing => "Executing",
            InstructionState::Declined => "Declined",
            InstructionState::Completed => "Completed",
        };
        f.write_str(s)
    }
}

/// Immutable status of one instruction.
///
/// Every transition produces a new value via the `with_*` copy operations;
/// a status is never mutated in place. The acknowledged state is tracked
/// independently of the primary state and only changes through
/// [`InstructionStatus::with_acknowledged_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionStatus {
    pub instruction_id: i64,
    pub state: InstructionState,
    /// Last primary state reported upstream, if any.
    pub acknowledged_state: Option<InstructionState>,
    pub status_date: DateTime<Utc>,
    /// Result details for terminal states, such as `message` and `code`.
    pub result_parameters: BTreeMap<String, String>,
}

impl InstructionStatus {
    /// Creates a status with no acknowledged state and no result parameters.
    pub fn new(instruction_id: i64, state: InstructionState, status_date: DateTime<Utc>) -> Self {
        Self {
            instruction_id,
            state,
            acknowledged_state: None,
            status_date,
            result_parameters: BTreeMap::new(),
        }
    }

    /// Copy with a new primary state and status date; everything else is
    /// carried over.
    pub fn with_state(&self, state: InstructionState, status_date: DateTime<Utc>) -> Self {
        Self {
            state,
            status_date,
            ..self.clone()
        }
    }

    /// Copy with the acknowledged state replaced.
    pub fn with_acknowledged_state(&self, state: InstructionState) -> Self {
        Self {
            acknowledged_state: Some(state),
            ..self.clone()
        }
    }

    /// Copy with the result parameters replaced.
    pub fn with_result_parameters(&self, parameters: BTreeMap<String, String>) -> Self {
        Self {
            result_parameters: parameters,
            ..self.clone()
        }
    }
}

/// Builds the standard `message`/`code` result parameter map for a failure.
pub fn error_result_parameters(message: &str, code: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert(MESSAGE_RESULT_PARAM.to_string(), message.to_string());
    params.insert(ERROR_CODE_RESULT_PARAM.to_string(), code.to_string());
    params
}

/// A durable directive with a topic and ordered, multi-valued parameters.
///
/// Instructions are immutable; the store and the jobs produce copies for
/// every change. Identity, and thus equality, is `(id, instructor_id)`.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub id: i64,
    pub topic: String,
    pub instruction_date: DateTime<Utc>,
    pub instructor_id: String,
    params: Vec<(String, String)>,
    pub status: InstructionStatus,
}

impl PartialEq for Instruction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.instructor_id == other.instructor_id
    }
}

impl Eq for Instruction {}

impl Instruction {
    pub fn new(
        id: i64,
        topic: impl Into<String>,
        instruction_date: DateTime<Utc>,
        instructor_id: impl Into<String>,
        params: Vec<(String, String)>,
        status: InstructionStatus,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            instruction_date,
            instructor_id: instructor_id.into(),
            params,
            status,
        }
    }

    /// Creates a locally generated instruction in the `Received` state with a
    /// placeholder id of zero; the store assigns the real id on insert.
    pub fn local(topic: &str, now: DateTime<Utc>, params: Vec<(String, String)>) -> Self {
        Self::new(
            0,
            topic,
            now,
            LOCAL_INSTRUCTOR_ID,
            params,
            InstructionStatus::new(0, InstructionState::Received, now),
        )
    }

    /// Parameters in their original order; keys may repeat.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// First value for `key`, if any.
    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key`, in order.
    pub fn param_values(&self, key: &str) -> Vec<&str> {
        self.params
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Current primary state.
    pub fn state(&self) -> InstructionState {
        self.status.state
    }

    /// Copy with the id replaced on both the instruction and its status.
    pub fn with_id(&self, id: i64) -> Self {
        let mut copy = self.clone();
        copy.id = id;
        copy.status.instruction_id = id;
        copy
    }

    /// Copy with a replacement status.
    pub fn with_status(&self, status: InstructionStatus) -> Self {
        let mut copy = self.clone();
        copy.status = status;
        copy
    }
}
