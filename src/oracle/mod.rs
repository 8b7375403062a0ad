//! Signal oracle seam: an external service that rates a symbol.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::risk::VolatilityRegime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

/// One oracle verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub signal: Signal,

    /// Conviction, 0 to 100
    pub strength: f64,

    #[serde(default)]
    pub suggested_stop: Option<Decimal>,

    #[serde(default)]
    pub suggested_target: Option<Decimal>,

    #[serde(default)]
    pub atr: Option<Decimal>,

    #[serde(default)]
    pub volatility_regime: VolatilityRegime,
}

#[async_trait]
pub trait SignalOracle: Send + Sync {
    async fn analyze(&self, symbol: &str) -> Result<Analysis>;
}

/// Oracle reached over HTTP at `GET {base_url}/analyze/{symbol}`.
pub struct HttpOracle {
    http: Client,
    base_url: String,
}

impl HttpOracle {
    pub fn new(base_url: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SignalOracle for HttpOracle {
    async fn analyze(&self, symbol: &str) -> Result<Analysis> {
        let url = format!("{}/analyze/{}", self.base_url, symbol);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("Oracle request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Oracle analyze failed: {} - {}", status, body);
        }

        response
            .json::<Analysis>()
            .await
            .context("Failed to parse oracle analysis")
    }
}
