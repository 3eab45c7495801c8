// In crates/api-client/src/lib.rs

use app_config::types::BybitSettings;
use async_trait::async_trait;
use chrono::Utc;
use core_types::{Side, Symbol};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use sha2::Sha256;

// Create a type alias for the HMAC-SHA256 implementation.
type HmacSha256 = Hmac<Sha256>;

pub mod error;
pub mod types;

// Re-export public types
pub use error::{Error, Result};
pub use types::*;

use crate::types::{ListResult, Ticker, WalletAccount};

/// Result codes meaning "requested state already holds". The exchange reports
/// them as errors, but for control-flow purposes they are successes: retrying
/// a leverage or trading-stop call that already took effect must not fail the
/// trade sequence.
pub const IDEMPOTENT_RET_CODES: [i64; 2] = [110043, 34036];

const CATEGORY: &str = "linear";

/// The authenticated exchange surface the engine operates against.
///
/// `ApiClient` is the live implementation; tests substitute mocks. Every
/// method corresponds to exactly one V5 endpoint.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Server time in epoch seconds. Used as a connectivity health check.
    async fn server_time(&self) -> Result<i64>;

    /// Total account equity in the quote currency.
    async fn wallet_balance(&self) -> Result<Decimal>;

    /// The live position for `symbol`, or `None` when flat.
    async fn position(&self, symbol: &Symbol) -> Result<Option<LivePosition>>;

    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<()>;

    /// Places a market order. `reduce_only` is set for flattening orders.
    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck>;

    /// Places a reduce-only limit order (take-profit rung).
    async fn place_reduce_only_limit(
        &self,
        symbol: &Symbol,
        side: Side,
        qty: Decimal,
        price: Decimal,
    ) -> Result<OrderAck>;

    /// Sets or moves the position's stop-loss via the trading-stop endpoint.
    async fn set_stop_loss(&self, symbol: &Symbol, price: Decimal) -> Result<()>;

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> Result<()>;

    async fn open_orders(&self, symbol: &Symbol) -> Result<Vec<OpenOrder>>;

    /// The current mark price for `symbol`.
    async fn mark_price(&self, symbol: &Symbol) -> Result<Decimal>;
}

/// Maps a position side to the exchange's order-side string.
fn order_side(side: Side) -> &'static str {
    match side {
        Side::Long => "Buy",
        Side::Short => "Sell",
    }
}

/// Parses a V5 response body and unwraps its `result` payload.
///
/// A zero `retCode` is success; the idempotent "already set" codes are
/// remapped to success; anything else is a hard `ApiError`.
fn check_envelope(body: &str) -> Result<Value> {
    let envelope: ApiEnvelope = serde_json::from_str(body).map_err(Error::DeserializationFailed)?;

    if envelope.ret_code == 0 || IDEMPOTENT_RET_CODES.contains(&envelope.ret_code) {
        Ok(envelope.result)
    } else {
        Err(Error::ApiError {
            code: envelope.ret_code,
            msg: envelope.ret_msg,
        })
    }
}

impl ApiClient {
    /// Constructs a new ApiClient from BybitSettings.
    pub fn new(settings: &BybitSettings) -> Result<Self> {
        let http_client = reqwest::Client::new();
        Ok(ApiClient {
            http_client,
            api_key: settings.api_key.clone(),
            secret_key: settings.secret_key.clone(),
            base_url: settings.rest_base_url.clone(),
            recv_window_ms: settings.recv_window_ms,
        })
    }

    /// Generates an HMAC-SHA256 signature for a prepared payload string.
    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        let result = mac.finalize();
        hex::encode(result.into_bytes())
    }

    /// Sends a signed GET request and returns the unwrapped `result` payload.
    ///
    /// V5 signs `timestamp + api_key + recv_window + query_string`.
    async fn signed_get(&self, path: &str, query: &str) -> Result<Value> {
        let timestamp = Utc::now().timestamp_millis();
        let payload = format!("{}{}{}{}", timestamp, self.api_key, self.recv_window_ms, query);
        let signature = self.sign(&payload);

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let response = self
            .http_client
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", signature)
            .send()
            .await
            .map_err(Error::RequestFailed)?;

        let text = response.text().await.map_err(Error::RequestFailed)?;
        check_envelope(&text)
    }

    /// Sends a signed POST request and returns the unwrapped `result` payload.
    ///
    /// V5 signs `timestamp + api_key + recv_window + raw_body`.
    async fn signed_post(&self, path: &str, body: &Value) -> Result<Value> {
        let timestamp = Utc::now().timestamp_millis();
        let raw_body = serde_json::to_string(body).map_err(Error::DeserializationFailed)?;
        let payload = format!("{}{}{}{}", timestamp, self.api_key, self.recv_window_ms, raw_body);
        let signature = self.sign(&payload);

        let url = format!("{}{}", self.base_url, path);

        let response = self
            .http_client
            .post(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(raw_body)
            .send()
            .await
            .map_err(Error::RequestFailed)?;

        let text = response.text().await.map_err(Error::RequestFailed)?;
        check_envelope(&text)
    }

    /// Sends an unauthenticated GET request (market-data endpoints).
    async fn public_get(&self, path: &str, query: &str) -> Result<Value> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let text = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(Error::RequestFailed)?
            .text()
            .await
            .map_err(Error::RequestFailed)?;

        check_envelope(&text)
    }
}

#[async_trait]
impl ExchangeApi for ApiClient {
    async fn server_time(&self) -> Result<i64> {
        let result = self.public_get("/v5/market/time", "").await?;
        let server_time: ServerTime =
            serde_json::from_value(result).map_err(Error::DeserializationFailed)?;
        server_time
            .time_second
            .parse::<i64>()
            .map_err(|e| Error::CustomError(format!("Unparseable server time: {}", e)))
    }

    async fn wallet_balance(&self) -> Result<Decimal> {
        let result = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        let accounts: ListResult<WalletAccount> =
            serde_json::from_value(result).map_err(Error::DeserializationFailed)?;
        accounts
            .list
            .first()
            .map(|a| a.total_equity)
            .ok_or_else(|| Error::CustomError("Wallet balance response had no accounts".to_string()))
    }

    async fn position(&self, symbol: &Symbol) -> Result<Option<LivePosition>> {
        let query = format!("category={}&symbol={}", CATEGORY, symbol.0);
        let result = self.signed_get("/v5/position/list", &query).await?;
        let positions: ListResult<LivePosition> =
            serde_json::from_value(result).map_err(Error::DeserializationFailed)?;

        // The exchange returns a flat entry (size 0, empty side) for symbols
        // with no open position.
        Ok(positions
            .list
            .into_iter()
            .find(|p| p.size > Decimal::ZERO && p.position_side().is_some()))
    }

    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol.0,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        self.signed_post("/v5/position/set-leverage", &body).await?;
        Ok(())
    }

    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol.0,
            "side": order_side(side),
            "orderType": "Market",
            "qty": qty.normalize().to_string(),
            "reduceOnly": reduce_only,
        });
        let result = self.signed_post("/v5/order/create", &body).await?;
        serde_json::from_value(result).map_err(Error::DeserializationFailed)
    }

    async fn place_reduce_only_limit(
        &self,
        symbol: &Symbol,
        side: Side,
        qty: Decimal,
        price: Decimal,
    ) -> Result<OrderAck> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol.0,
            "side": order_side(side),
            "orderType": "Limit",
            "qty": qty.normalize().to_string(),
            "price": price.normalize().to_string(),
            "timeInForce": "GTC",
            "reduceOnly": true,
        });
        let result = self.signed_post("/v5/order/create", &body).await?;
        serde_json::from_value(result).map_err(Error::DeserializationFailed)
    }

    async fn set_stop_loss(&self, symbol: &Symbol, price: Decimal) -> Result<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol.0,
            "stopLoss": price.normalize().to_string(),
            "positionIdx": 0,
        });
        self.signed_post("/v5/position/trading-stop", &body).await?;
        Ok(())
    }

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> Result<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol.0,
            "orderId": order_id,
        });
        self.signed_post("/v5/order/cancel", &body).await?;
        Ok(())
    }

    async fn open_orders(&self, symbol: &Symbol) -> Result<Vec<OpenOrder>> {
        let query = format!("category={}&symbol={}", CATEGORY, symbol.0);
        let result = self.signed_get("/v5/order/realtime", &query).await?;
        let orders: ListResult<OpenOrder> =
            serde_json::from_value(result).map_err(Error::DeserializationFailed)?;
        Ok(orders.list)
    }

    async fn mark_price(&self, symbol: &Symbol) -> Result<Decimal> {
        let query = format!("category={}&symbol={}", CATEGORY, symbol.0);
        let result = self.public_get("/v5/market/tickers", &query).await?;
        let tickers: ListResult<Ticker> =
            serde_json::from_value(result).map_err(Error::DeserializationFailed)?;
        tickers
            .list
            .first()
            .map(|t| t.mark_price)
            .ok_or_else(|| Error::CustomError(format!("No ticker returned for {}", symbol.0)))
    }
}

// Free function to allow api_client::new usage
pub fn new(settings: &BybitSettings) -> Result<ApiClient> {
    ApiClient::new(settings)
}
