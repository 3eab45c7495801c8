// In crates/risk/src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid risk distance: entry and stop-loss prices are equal")]
    InvalidRiskDistance,

    #[error("Sizing rejected: {reason}")]
    Rejected { reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
