// In crates/engine/src/testing.rs

//! A scriptable mock exchange shared by the engine's test modules.

use api_client::{ExchangeApi, LivePosition, OpenOrder, OrderAck, Result};
use async_trait::async_trait;
use core_types::{Side, Symbol};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Mutex;

/// Records every call in order; live state is mutable so tests can walk the
/// mark price between polls or flatten the position mid-test.
#[derive(Default)]
pub(crate) struct MockExchange {
    calls: Mutex<Vec<String>>,
    mark: Mutex<Decimal>,
    /// Size reported by the position query; `None` means flat.
    live_size: Mutex<Option<Decimal>>,
    live_side: Mutex<String>,
    open_orders: Mutex<Vec<String>>,
    /// Remaining stop-loss calls to reject before accepting them again.
    stop_loss_failures: Mutex<u32>,
}

impl MockExchange {
    pub fn with_live_long(size: Decimal, mark: Decimal) -> Self {
        Self {
            mark: Mutex::new(mark),
            live_size: Mutex::new(Some(size)),
            live_side: Mutex::new("Buy".to_string()),
            ..Self::default()
        }
    }

    pub fn set_mark(&self, price: Decimal) {
        *self.mark.lock().unwrap() = price;
    }

    pub fn go_flat(&self) {
        *self.live_size.lock().unwrap() = None;
    }

    pub fn fail_stop_losses(&self, times: u32) {
        *self.stop_loss_failures.lock().unwrap() = times;
    }

    pub fn add_open_order(&self, order_id: &str) {
        self.open_orders.lock().unwrap().push(order_id.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn server_time(&self) -> Result<i64> {
        self.record("server_time".to_string());
        Ok(1_700_000_000)
    }

    async fn wallet_balance(&self) -> Result<Decimal> {
        self.record("wallet_balance".to_string());
        Ok(dec!(1000))
    }

    async fn position(&self, symbol: &Symbol) -> Result<Option<LivePosition>> {
        self.record(format!("position {}", symbol.0));
        let size = *self.live_size.lock().unwrap();
        let mark = *self.mark.lock().unwrap();
        Ok(size.map(|size| LivePosition {
            symbol: symbol.0.clone(),
            side: self.live_side.lock().unwrap().clone(),
            size,
            avg_price: Some(dec!(100)),
            mark_price: Some(mark),
            // Left unset so PnL falls back to the local computation.
            unrealised_pnl: None,
            leverage: Some(dec!(20)),
            stop_loss: None,
        }))
    }

    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<()> {
        self.record(format!("set_leverage {} {}", symbol.0, leverage));
        Ok(())
    }

    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck> {
        self.record(format!(
            "market {} {:?} {} reduce_only={}",
            symbol.0, side, qty, reduce_only
        ));
        if reduce_only {
            *self.live_size.lock().unwrap() = None;
        }
        Ok(OrderAck {
            order_id: "ORDER_1".to_string(),
            order_link_id: String::new(),
        })
    }

    async fn place_reduce_only_limit(
        &self,
        symbol: &Symbol,
        side: Side,
        qty: Decimal,
        price: Decimal,
    ) -> Result<OrderAck> {
        self.record(format!("tp {} {:?} {} @ {}", symbol.0, side, qty, price));
        Ok(OrderAck {
            order_id: "TP_1".to_string(),
            order_link_id: String::new(),
        })
    }

    async fn set_stop_loss(&self, symbol: &Symbol, price: Decimal) -> Result<()> {
        self.record(format!("stop_loss {} @ {}", symbol.0, price));
        let mut failures = self.stop_loss_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(api_client::Error::ApiError {
                code: 110007,
                msg: "rejected".to_string(),
            });
        }
        Ok(())
    }

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> Result<()> {
        self.record(format!("cancel {} {}", symbol.0, order_id));
        Ok(())
    }

    async fn open_orders(&self, symbol: &Symbol) -> Result<Vec<OpenOrder>> {
        self.record(format!("open_orders {}", symbol.0));
        Ok(self
            .open_orders
            .lock()
            .unwrap()
            .iter()
            .map(|id| OpenOrder {
                order_id: id.clone(),
                symbol: symbol.0.clone(),
                side: "Sell".to_string(),
                order_type: "Limit".to_string(),
                qty: dec!(1),
                reduce_only: true,
            })
            .collect())
    }

    async fn mark_price(&self, symbol: &Symbol) -> Result<Decimal> {
        self.record(format!("mark_price {}", symbol.0));
        Ok(*self.mark.lock().unwrap())
    }
}
