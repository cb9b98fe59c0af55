//! Contracts implemented by the external device collaborators.
//!
//! Hardware protocol adapters (BACnet, CAN bus, serial I/O) live outside this
//! crate; the decision loop only depends on these traits.

use crate::shedder::sample::PowerSample;

/// Value type reported for a control.
///
/// Only `Boolean` controls are interpretable by the shed strategy today;
/// other types are skipped with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlValueType {
    Boolean,
    Integer,
    Float,
    String,
}

/// Point-in-time state of one controllable switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInfo {
    pub control_id: String,
    pub value_type: ControlValueType,
    /// Raw value as reported by the provider.
    pub value: String,
}

/// Collaborator exposing a set of controllable switches.
pub trait ControlProvider: Send + Sync {
    /// Control ids this provider can report on.
    fn available_control_ids(&self) -> Vec<String>;

    /// Current state of the given control, if readable.
    fn current_control_info(&self, control_id: &str) -> Option<ControlInfo>;
}

/// Metering collaborator supplying instantaneous power readings.
pub trait PowerSource: Send + Sync {
    /// Read the current power draw, if a reading is available.
    fn read_power(&self) -> Option<PowerSample>;
}
