//! Durable instruction execution engine.

pub mod execution;
pub mod instruction;
/// Periodic execution, acknowledgement, and cleanup drivers.
pub mod jobs;
pub mod store;

// Re-export the main types for convenience
pub use execution::InstructionExecutionService;
pub use execution::InstructionHandler;
pub use instruction::Instruction;
pub use instruction::InstructionState;
pub use instruction::InstructionStatus;
pub use jobs::InstructionAcknowledgeJob;
pub use jobs::InstructionCleanupJob;
pub use jobs::InstructionExecutionJob;
pub use store::InstructionStore;
pub use store::MemoryInstructionStore;
