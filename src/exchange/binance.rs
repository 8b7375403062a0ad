//! Binance spot REST client.
//!
//! Public market data needs no credentials. Account and order endpoints are
//! signed with HMAC-SHA256 over the query string and carry a timestamp
//! corrected by the offset the resilience layer last measured.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Exchange, Liquidity, OpenOrder, OrderReceipt, OrderRequest};
use crate::error::ExchangeError;
use crate::models::Side;

pub const MAINNET_URL: &str = "https://api.binance.com";
pub const TESTNET_URL: &str = "https://testnet.binance.vision";

const RECV_WINDOW_MS: u64 = 60_000;

/// LOT_SIZE filter of a symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LotSize {
    pub min_qty: Decimal,
    pub step_size: Decimal,
}

impl LotSize {
    /// Round a quantity down to the step and reject it below the minimum.
    pub fn adjust(&self, quantity: Decimal) -> Result<Decimal, ExchangeError> {
        let adjusted = if self.step_size > Decimal::ZERO {
            ((quantity / self.step_size).floor() * self.step_size).normalize()
        } else {
            quantity
        };
        if adjusted <= Decimal::ZERO || adjusted < self.min_qty {
            return Err(ExchangeError::OrderRejected(format!(
                "quantity {} below minimum {}",
                quantity, self.min_qty
            )));
        }
        Ok(adjusted)
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTime {
    server_time: i64,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    bid_price: Decimal,
    ask_price: Decimal,
    quote_volume: Decimal,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    symbol: String,
    status: String,
    executed_qty: Decimal,
    cummulative_quote_qty: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenOrderResponse {
    order_id: i64,
    symbol: String,
    side: String,
    orig_qty: Decimal,
    price: Decimal,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<AssetBalance>,
}

#[derive(Debug, Deserialize)]
struct AssetBalance {
    asset: String,
    free: Decimal,
}

/// Binance spot API client.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    time_offset_ms: AtomicI64,
    lot_sizes: RwLock<HashMap<String, LotSize>>,
}

impl BinanceClient {
    pub fn new(api_key: String, api_secret: String, testnet: bool) -> Result<Self, ExchangeError> {
        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL };
        Self::with_base_url(base_url.to_string(), api_key, api_secret)
    }

    /// Client for public market data only.
    pub fn public(testnet: bool) -> Result<Self, ExchangeError> {
        Self::new(String::new(), String::new(), testnet)
    }

    pub fn with_base_url(base_url: String, api_key: String, api_secret: String) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ExchangeError::Other(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            api_key,
            api_secret,
            time_offset_ms: AtomicI64::new(0),
            lot_sizes: RwLock::new(HashMap::new()),
        })
    }

    fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }

    /// Hex HMAC-SHA256 of a query string.
    pub fn sign(secret: &str, payload: &str) -> Result<String, ExchangeError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|e| ExchangeError::Auth(format!("invalid API secret: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn timestamp(&self) -> i64 {
        Utc::now().timestamp_millis() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    async fn public_get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).query(query).send().await?;
        let response = check(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn signed<T: DeserializeOwned>(&self, method: Method, path: &str, params: &[(&str, String)]) -> Result<T, ExchangeError> {
        if !self.has_credentials() {
            return Err(ExchangeError::Auth("API key and secret are required".to_string()));
        }

        let mut query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        query.push(format!("recvWindow={}", RECV_WINDOW_MS));
        query.push(format!("timestamp={}", self.timestamp()));
        let query = query.join("&");
        let signature = Self::sign(&self.api_secret, &query)?;

        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);
        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// LOT_SIZE filter for a symbol, cached after the first lookup.
    pub async fn lot_size(&self, symbol: &str) -> Result<LotSize, ExchangeError> {
        if let Some(lot) = self.lot_sizes.read().await.get(symbol) {
            return Ok(*lot);
        }

        let info: ExchangeInfo = self
            .public_get("/api/v3/exchangeInfo", &[("symbol", symbol.to_string())])
            .await?;
        let lot = info
            .symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .and_then(|s| {
                s.filters
                    .iter()
                    .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some("LOT_SIZE"))
            })
            .and_then(|f| {
                let min_qty = f.get("minQty")?.as_str()?.parse().ok()?;
                let step_size = f.get("stepSize")?.as_str()?.parse().ok()?;
                Some(LotSize { min_qty, step_size })
            })
            .ok_or_else(|| ExchangeError::Other(format!("no LOT_SIZE filter for {}", symbol)))?;

        self.lot_sizes.write().await.insert(symbol.to_string(), lot);
        Ok(lot)
    }
}

/// Turn a non-success response into a typed error.
async fn check(response: Response) -> Result<Response, ExchangeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if let Ok(api) = serde_json::from_str::<ApiError>(&body) {
        return Err(ExchangeError::from_api_code(api.code, api.msg));
    }

    let detail = format!("{} - {}", status, body);
    Err(match status.as_u16() {
        418 | 429 => ExchangeError::RateLimited(detail),
        401 => ExchangeError::Auth(detail),
        500..=599 => ExchangeError::Connectivity(detail),
        _ => ExchangeError::Other(detail),
    })
}

#[async_trait]
impl Exchange for BinanceClient {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderReceipt, ExchangeError> {
        let lot = self.lot_size(&order.symbol).await?;
        let quantity = lot.adjust(order.quantity)?;

        let params = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.to_string()),
            ("newOrderRespType", "FULL".to_string()),
        ];

        let response: OrderResponse = self.signed(Method::POST, "/api/v3/order", &params).await?;
        let avg_price = if response.executed_qty > Decimal::ZERO {
            Some(response.cummulative_quote_qty / response.executed_qty)
        } else {
            None
        };

        debug!(order_id = response.order_id, symbol = %response.symbol, status = %response.status, "Order accepted");

        Ok(OrderReceipt {
            order_id: response.order_id.to_string(),
            symbol: response.symbol,
            side: order.side,
            executed_qty: response.executed_qty,
            avg_price,
            status: response.status,
        })
    }

    async fn get_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let ticker: TickerPrice = self
            .public_get("/api/v3/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        Ok(ticker.price)
    }

    async fn get_prices(&self, symbols: &[String]) -> Result<HashMap<String, Decimal>, ExchangeError> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let list = serde_json::to_string(symbols).map_err(|e| ExchangeError::Other(e.to_string()))?;
        let tickers: Vec<TickerPrice> = self
            .public_get("/api/v3/ticker/price", &[("symbols", list)])
            .await?;
        Ok(tickers.into_iter().map(|t| (t.symbol, t.price)).collect())
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
        let orders: Vec<OpenOrderResponse> = self.signed(Method::GET, "/api/v3/openOrders", &[]).await?;
        orders
            .into_iter()
            .map(|o| {
                let side = o.side.parse::<Side>().map_err(|e| ExchangeError::Other(e.to_string()))?;
                Ok(OpenOrder {
                    order_id: o.order_id.to_string(),
                    symbol: o.symbol,
                    side,
                    quantity: o.orig_qty,
                    price: o.price,
                })
            })
            .collect()
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self
            .signed(
                Method::DELETE,
                "/api/v3/order",
                &[("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
            )
            .await?;
        Ok(())
    }

    async fn balance(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        let account: AccountResponse = self.signed(Method::GET, "/api/v3/account", &[]).await?;
        Ok(account
            .balances
            .into_iter()
            .find(|b| b.asset == asset)
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO))
    }

    async fn liquidity(&self, symbol: &str) -> Result<Liquidity, ExchangeError> {
        let ticker: Ticker24h = self
            .public_get("/api/v3/ticker/24hr", &[("symbol", symbol.to_string())])
            .await?;
        Ok(Liquidity {
            bid: ticker.bid_price,
            ask: ticker.ask_price,
            quote_volume: ticker.quote_volume,
        })
    }

    async fn server_time(&self) -> Result<i64, ExchangeError> {
        let time: ServerTime = self.public_get("/api/v3/time", &[]).await?;
        Ok(time.server_time)
    }

    fn set_time_offset(&self, offset_ms: i64) {
        self.time_offset_ms.store(offset_ms, Ordering::Relaxed);
    }
}
