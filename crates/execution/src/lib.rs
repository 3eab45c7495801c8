// In crates/execution/src/lib.rs

pub mod coordinator;
pub mod error;
pub mod types;

// Re-export public types
pub use coordinator::TradeExecutionCoordinator;
pub use error::{Error, Result};
pub use types::{ExecutionSettings, ExecutionState, TakeProfitFailurePolicy, TradeOutcome};
