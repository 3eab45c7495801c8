// In crates/engine/src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Signal validation failed: {0}")]
    InvalidSignal(#[from] core_types::Error),

    #[error("An active position already exists for {symbol}")]
    DuplicatePosition { symbol: String },

    #[error("Trade execution failed: {0}")]
    Execution(#[from] execution::Error),

    #[error("API client error: {0}")]
    ApiClient(#[from] api_client::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
