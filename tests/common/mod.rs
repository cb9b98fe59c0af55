//! Shared test fixtures for integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use loadshed::control::{ControlInfo, ControlProvider, ControlValueType, PowerSource};
use loadshed::reactor::execution::{HandlerError, HandlerOutcome, InstructionHandler};
use loadshed::reactor::instruction::{Instruction, InstructionState, TOPIC_SHED_LOAD};
use loadshed::reactor::jobs::{AckError, AcknowledgementService};
use loadshed::shedder::sample::PowerSample;

/// Fixed reference instant for deterministic tests.
pub fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

/// A bank of Boolean switch controls whose limiting state handlers can flip.
pub struct SwitchBank {
    limiting: Mutex<HashMap<String, bool>>,
}

impl SwitchBank {
    pub fn new(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            limiting: Mutex::new(ids.iter().map(|id| (id.to_string(), false)).collect()),
        })
    }

    pub fn is_limiting(&self, control_id: &str) -> bool {
        self.limiting
            .lock()
            .unwrap()
            .get(control_id)
            .copied()
            .unwrap_or(false)
    }

    pub fn set_limiting(&self, control_id: &str, limiting: bool) {
        if let Some(entry) = self.limiting.lock().unwrap().get_mut(control_id) {
            *entry = limiting;
        }
    }
}

impl ControlProvider for SwitchBank {
    fn available_control_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.limiting.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn current_control_info(&self, control_id: &str) -> Option<ControlInfo> {
        let limiting = self.limiting.lock().unwrap().get(control_id).copied()?;
        Some(ControlInfo {
            control_id: control_id.to_string(),
            value_type: ControlValueType::Boolean,
            value: if limiting { "1" } else { "0" }.to_string(),
        })
    }
}

/// Handler that applies `ShedLoad` instructions to a switch bank.
///
/// A positive watts parameter engages the limit, zero or negative removes it.
pub struct ShedLoadHandler {
    pub bank: Arc<SwitchBank>,
}

impl InstructionHandler for ShedLoadHandler {
    fn handles_topic(&self, topic: &str) -> bool {
        topic == TOPIC_SHED_LOAD
    }

    fn process(&self, instruction: &Instruction) -> Result<Option<HandlerOutcome>, HandlerError> {
        for (control_id, value) in instruction.params() {
            let watts: i32 = value
                .parse()
                .map_err(|_| HandlerError::new(format!("bad watts value \"{value}\"")))?;
            self.bank.set_limiting(control_id, watts > 0);
        }
        Ok(Some(HandlerOutcome::State(InstructionState::Completed)))
    }
}

/// Power source replaying queued readings in push order.
pub struct ScriptedPower {
    readings: Mutex<VecDeque<PowerSample>>,
}

impl ScriptedPower {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            readings: Mutex::new(VecDeque::new()),
        })
    }

    pub fn push(&self, sample: PowerSample) {
        self.readings.lock().unwrap().push_back(sample);
    }
}

impl PowerSource for ScriptedPower {
    fn read_power(&self) -> Option<PowerSample> {
        self.readings.lock().unwrap().pop_front()
    }
}

/// Acknowledgement collaborator recording batches, optionally failing.
pub struct RecordingAck {
    fail: Mutex<bool>,
    pub batches: Mutex<Vec<Vec<i64>>>,
}

impl RecordingAck {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: Mutex::new(false),
            batches: Mutex::new(Vec::new()),
        })
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

impl AcknowledgementService for RecordingAck {
    fn acknowledge(&self, instructions: &[Instruction]) -> Result<(), AckError> {
        self.batches
            .lock()
            .unwrap()
            .push(instructions.iter().map(|i| i.id).collect());
        if *self.fail.lock().unwrap() {
            Err(AckError::new("upstream unavailable"))
        } else {
            Ok(())
        }
    }
}
