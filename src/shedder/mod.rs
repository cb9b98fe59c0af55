//! Demand-response decision loop.

/// Rule filtering and priority ordering.
pub mod rules;
/// Time-weighted power sample aggregation.
pub mod sample;
pub mod service;
pub mod strategy;
/// Decision-to-instruction translation.
pub mod translate;

// Re-export the main types for convenience
pub use rules::ShedRule;
pub use sample::PowerSample;
pub use sample::SampleBuffer;
pub use service::LoadShedder;
pub use strategy::ShedAction;
pub use strategy::ShedControlInfo;
pub use strategy::ShedStrategy;
