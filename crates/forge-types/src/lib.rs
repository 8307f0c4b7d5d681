pub mod error;
pub mod execution;

// Re-exports for convenience
pub use error::{ForgeError, Result};
pub use execution::{ExecutionRequest, ExecutionResult, InstanceState, LogChunk, StreamKind};
