//! Node-local demand-response load shedding with a durable instruction reactor.

pub mod config;
/// Contracts for the control-provider and metering collaborators.
pub mod control;
/// Durable instruction engine: value types, store, dispatch, periodic jobs.
pub mod reactor;
/// Decision loop: power averaging, rule evaluation, action translation.
pub mod shedder;
