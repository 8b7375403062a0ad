//! Order and market data types shared by exchange implementations.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::Side;

/// Market order to submit.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            quantity,
        }
    }
}

/// Confirmation of an accepted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    /// Base quantity filled
    pub executed_qty: Decimal,
    /// Average fill price when the exchange reports one
    pub avg_price: Option<Decimal>,
    pub status: String,
}

/// Resting order on the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
}

/// Book and volume snapshot used for admission checks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Liquidity {
    pub bid: Decimal,
    pub ask: Decimal,
    /// 24h traded volume in quote currency
    pub quote_volume: Decimal,
}

impl Liquidity {
    /// Bid/ask spread as a percentage of mid.
    pub fn spread_pct(&self) -> Option<Decimal> {
        let mid = (self.bid + self.ask) / dec!(2);
        if mid <= Decimal::ZERO || self.ask < self.bid {
            return None;
        }
        Some((self.ask - self.bid) / mid * dec!(100))
    }
}
