// In crates/risk/src/lib.rs

pub mod error;
pub mod sizer;
pub mod types;

// Re-export public types
pub use error::{Error, Result};
pub use sizer::PositionSizer;
pub use types::{PositionSize, SizerSettings};
