//! Paper-trading exchange for dry runs.
//!
//! Orders fill instantly at the last known price against an in-memory quote
//! balance. Prices come from an optional upstream feed (typically the public
//! Binance endpoints) or are set directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::info;

use super::{Exchange, Liquidity, OpenOrder, OrderReceipt, OrderRequest};
use crate::error::ExchangeError;
use crate::models::Side;

pub struct PaperExchange {
    quote_asset: String,
    balance: RwLock<Decimal>,
    prices: RwLock<HashMap<String, Decimal>>,
    feed: Option<Arc<dyn Exchange>>,
    next_order_id: AtomicU64,
    fills: RwLock<Vec<OrderReceipt>>,
}

impl PaperExchange {
    pub fn new(quote_asset: &str, balance: Decimal) -> Self {
        Self {
            quote_asset: quote_asset.to_string(),
            balance: RwLock::new(balance),
            prices: RwLock::new(HashMap::new()),
            feed: None,
            next_order_id: AtomicU64::new(1),
            fills: RwLock::new(Vec::new()),
        }
    }

    /// Take prices and liquidity from an upstream exchange.
    pub fn with_feed(mut self, feed: Arc<dyn Exchange>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    /// Orders filled so far, oldest first.
    pub async fn fills(&self) -> Vec<OrderReceipt> {
        self.fills.read().await.clone()
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        if let Some(feed) = &self.feed {
            let price = feed.get_price(symbol).await?;
            self.set_price(symbol, price).await;
            return Ok(price);
        }
        self.prices
            .read()
            .await
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Other(format!("no price for {}", symbol)))
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderReceipt, ExchangeError> {
        if order.quantity <= Decimal::ZERO {
            return Err(ExchangeError::OrderRejected("quantity must be positive".to_string()));
        }
        let price = self.last_price(&order.symbol).await?;
        let value = order.quantity * price;

        {
            let mut balance = self.balance.write().await;
            match order.side {
                Side::Long => {
                    if *balance < value {
                        return Err(ExchangeError::OrderRejected(format!(
                            "insufficient balance: {} < {}",
                            *balance, value
                        )));
                    }
                    *balance -= value;
                }
                Side::Short => *balance += value,
            }
        }

        let receipt = OrderReceipt {
            order_id: format!("paper-{}", self.next_order_id.fetch_add(1, Ordering::Relaxed)),
            symbol: order.symbol.clone(),
            side: order.side,
            executed_qty: order.quantity,
            avg_price: Some(price),
            status: "FILLED".to_string(),
        };

        info!(
            order_id = %receipt.order_id,
            symbol = %order.symbol,
            side = %order.side,
            quantity = %order.quantity,
            price = %price,
            "[DRY RUN] Order filled"
        );

        self.fills.write().await.push(receipt.clone());
        Ok(receipt)
    }

    async fn get_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.last_price(symbol).await
    }

    async fn get_prices(&self, symbols: &[String]) -> Result<HashMap<String, Decimal>, ExchangeError> {
        if let Some(feed) = &self.feed {
            let prices = feed.get_prices(symbols).await?;
            self.prices.write().await.extend(prices.clone());
            return Ok(prices);
        }
        let prices = self.prices.read().await;
        Ok(symbols
            .iter()
            .filter_map(|s| prices.get(s).map(|p| (s.clone(), *p)))
            .collect())
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn balance(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        if asset == self.quote_asset {
            Ok(*self.balance.read().await)
        } else {
            Ok(Decimal::ZERO)
        }
    }

    async fn liquidity(&self, symbol: &str) -> Result<Liquidity, ExchangeError> {
        if let Some(feed) = &self.feed {
            return feed.liquidity(symbol).await;
        }
        let price = self.last_price(symbol).await?;
        Ok(Liquidity {
            bid: price,
            ask: price,
            quote_volume: dec!(1000000000),
        })
    }

    async fn server_time(&self) -> Result<i64, ExchangeError> {
        Ok(Utc::now().timestamp_millis())
    }

    fn set_time_offset(&self, _offset_ms: i64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_fills_against_balance() {
        let paper = PaperExchange::new("USDT", dec!(1000));
        paper.set_price("BTCUSDT", dec!(100)).await;

        let receipt = assert_ok!(paper.place_order(&OrderRequest::market("BTCUSDT", Side::Long, dec!(2))).await);
        assert_eq!(receipt.avg_price, Some(dec!(100)));
        assert_eq!(paper.balance("USDT").await.unwrap(), dec!(800));

        paper.set_price("BTCUSDT", dec!(110)).await;
        assert_ok!(paper.place_order(&OrderRequest::market("BTCUSDT", Side::Short, dec!(2))).await);
        assert_eq!(paper.balance("USDT").await.unwrap(), dec!(1020));
        assert_eq!(paper.fills().await.len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_unaffordable_order() {
        let paper = PaperExchange::new("USDT", dec!(50));
        paper.set_price("ETHUSDT", dec!(100)).await;
        let err = assert_err!(paper.place_order(&OrderRequest::market("ETHUSDT", Side::Long, dec!(1))).await);
        assert!(matches!(err, ExchangeError::OrderRejected(_)));
    }
}
