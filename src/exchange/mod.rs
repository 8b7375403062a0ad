//! Exchange access: the `Exchange` seam, a Binance spot REST client, a
//! paper-trading double, and the resilience layer every call goes through.

mod binance;
mod circuit;
mod paper;
mod resilience;
mod types;

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::ExchangeError;

pub use binance::BinanceClient;
pub use circuit::{CircuitBreaker, CircuitEvent, CircuitStatus};
pub use paper::PaperExchange;
pub use resilience::{ResilientClient, RetryPolicy};
pub use types::{Liquidity, OpenOrder, OrderReceipt, OrderRequest};

/// Operations the engine needs from a spot exchange.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderReceipt, ExchangeError>;

    async fn get_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    async fn get_prices(&self, symbols: &[String]) -> Result<HashMap<String, Decimal>, ExchangeError>;

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    /// Free balance of one asset.
    async fn balance(&self, asset: &str) -> Result<Decimal, ExchangeError>;

    /// Top of book and 24h quote volume.
    async fn liquidity(&self, symbol: &str) -> Result<Liquidity, ExchangeError>;

    /// Server time in epoch milliseconds.
    async fn server_time(&self) -> Result<i64, ExchangeError>;

    /// Offset (server minus local, ms) applied to signed request timestamps.
    fn set_time_offset(&self, offset_ms: i64);
}
