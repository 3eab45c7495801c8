// In crates/core-types/src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid signal: {reason}")]
    InvalidSignal { reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
