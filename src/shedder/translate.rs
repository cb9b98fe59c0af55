use chrono::{DateTime, Utc};

use crate::reactor::instruction::{Instruction, TOPIC_SHED_LOAD};

use super::strategy::ShedAction;

/// Translates a shed decision into a durable `ShedLoad` instruction.
///
/// The parameter key is the control id and the value the requested shed
/// watts as a decimal string; zero or negative signals "remove limit". The
/// returned instruction is in the `Received` state, ready for the
/// instruction store boundary.
pub fn shed_load_instruction(action: &ShedAction, now: DateTime<Utc>) -> Instruction {
    Instruction::local(
        TOPIC_SHED_LOAD,
        now,
        vec![(action.control_id.clone(), action.shed_watts.to_string())],
    )
}
