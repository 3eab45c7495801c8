// In crates/api-client/src/types.rs

use core_types::Side;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// The main client for interacting with the Bybit V5 API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    /// The persistent HTTP client.
    pub http_client: Client,
    /// The user's Bybit API key.
    pub api_key: String,
    /// The user's Bybit secret key.
    pub secret_key: String,
    /// The base URL for the Bybit V5 API.
    pub base_url: String,
    /// The signed-request receive window, in milliseconds.
    pub recv_window_ms: u64,
}

/// The JSON envelope every V5 endpoint responds with.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope {
    #[serde(rename = "retCode")]
    pub ret_code: i64,
    #[serde(rename = "retMsg", default)]
    pub ret_msg: String,
    #[serde(default)]
    pub result: Value,
}

/// Bybit encodes absent decimal fields as empty strings.
pub(crate) fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => s
            .parse::<Decimal>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// The server-time payload from `GET /v5/market/time`.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerTime {
    #[serde(rename = "timeSecond")]
    pub time_second: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListResult<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
}

/// One account entry from the wallet-balance endpoint.
#[derive(Debug, Deserialize, Clone)]
pub(crate) struct WalletAccount {
    #[serde(rename = "totalEquity")]
    pub total_equity: Decimal,
}

/// A single live position as returned by `GET /v5/position/list`.
#[derive(Debug, Deserialize, Clone)]
pub struct LivePosition {
    pub symbol: String,
    /// "Buy", "Sell", or "" when flat.
    pub side: String,
    pub size: Decimal,
    #[serde(rename = "avgPrice", deserialize_with = "empty_string_as_none", default)]
    pub avg_price: Option<Decimal>,
    #[serde(rename = "markPrice", deserialize_with = "empty_string_as_none", default)]
    pub mark_price: Option<Decimal>,
    #[serde(rename = "unrealisedPnl", deserialize_with = "empty_string_as_none", default)]
    pub unrealised_pnl: Option<Decimal>,
    #[serde(deserialize_with = "empty_string_as_none", default)]
    pub leverage: Option<Decimal>,
    #[serde(rename = "stopLoss", deserialize_with = "empty_string_as_none", default)]
    pub stop_loss: Option<Decimal>,
}

impl LivePosition {
    /// The position side, `None` when the entry represents a flat book.
    pub fn position_side(&self) -> Option<Side> {
        match self.side.as_str() {
            "Buy" => Some(Side::Long),
            "Sell" => Some(Side::Short),
            _ => None,
        }
    }
}

/// The acknowledgement returned when an order is accepted.
#[derive(Debug, Deserialize, Clone)]
pub struct OrderAck {
    #[serde(rename = "orderId")]
    pub order_id: String,
    #[serde(rename = "orderLinkId", default)]
    pub order_link_id: String,
}

/// One open order from `GET /v5/order/realtime`.
#[derive(Debug, Deserialize, Clone)]
pub struct OpenOrder {
    #[serde(rename = "orderId")]
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    #[serde(rename = "orderType")]
    pub order_type: String,
    pub qty: Decimal,
    #[serde(rename = "reduceOnly", default)]
    pub reduce_only: bool,
}

/// One ticker entry from `GET /v5/market/tickers`.
#[derive(Debug, Deserialize, Clone)]
pub(crate) struct Ticker {
    #[serde(rename = "markPrice")]
    pub mark_price: Decimal,
}
