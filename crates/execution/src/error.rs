// In crates/execution/src/error.rs

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("API client error: {0}")]
    ApiClient(#[from] api_client::Error),

    #[error("Sizing error: {0}")]
    Risk(#[from] risk::Error),

    #[error("Order quantity {qty} floors to zero whole units")]
    QuantityTooSmall { qty: Decimal },

    #[error("Fill verification failed: no live position for {symbol} after the settlement delay")]
    FillVerificationFailed { symbol: String },

    #[error("Stop-loss could not be set after {attempts} attempts")]
    StopLossSetFailed { attempts: u32 },

    #[error("Take-profit placement failed: {source}")]
    TakeProfitSetFailed {
        #[source]
        source: api_client::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
