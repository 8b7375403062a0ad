//! Bot configuration: environment defaults, persisted overrides, sanitizing.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::exchange::RetryPolicy;
use crate::risk::RiskParameters;
use crate::tuner::TunerConfig;

/// Exchange and notifier credentials. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

/// Full bot configuration. The single persisted document is this struct
/// serialized to JSON, minus credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    #[serde(skip)]
    pub credentials: Credentials,

    /// Use the exchange testnet
    pub testnet: bool,

    /// Fill orders against a paper exchange fed by live prices
    pub dry_run: bool,

    /// Starting quote balance for dry runs
    pub paper_balance: Decimal,

    /// Asset balances and sizing are expressed in
    pub quote_asset: String,

    /// Symbols scanned for entries
    pub symbols: Vec<String>,

    /// Symbols never entered
    pub symbol_blacklist: Vec<String>,

    /// UTC hours in which no entries are made
    pub blocked_hours: Vec<u32>,

    /// Take SELL signals as short entries
    pub allow_short: bool,

    /// Control loop tick interval (seconds)
    pub loop_interval_secs: u64,

    /// Balance cache lifetime (seconds)
    pub balance_cache_ttl_secs: u64,

    /// Daily realized loss limit in percent of balance (0 disables)
    pub daily_drawdown_limit: Decimal,

    /// Weekly realized loss limit in percent of balance (0 disables)
    pub weekly_drawdown_limit: Decimal,

    /// Maximum bid/ask spread in percent
    pub max_spread_pct: Decimal,

    /// Minimum 24h quote volume
    pub min_quote_volume: Decimal,

    /// Rounds of close attempts at shutdown
    pub shutdown_close_rounds: u32,

    /// Pause between shutdown close rounds (seconds)
    pub shutdown_retry_delay_secs: u64,

    /// Signal oracle base URL
    pub oracle_url: String,

    pub risk: RiskParameters,

    pub retry: RetryPolicy,

    pub tuner: TunerConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            testnet: true,
            dry_run: true,
            paper_balance: dec!(1000),
            quote_asset: "USDT".to_string(),
            symbols: ["BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT", "XRPUSDT"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            symbol_blacklist: Vec::new(),
            blocked_hours: vec![4, 5, 6, 22, 23],  // thin liquidity windows (UTC)
            allow_short: false,                   // spot account
            loop_interval_secs: 15,
            balance_cache_ttl_secs: 30,
            daily_drawdown_limit: Decimal::ZERO,
            weekly_drawdown_limit: Decimal::ZERO,
            max_spread_pct: dec!(0.25),
            min_quote_volume: dec!(100000),
            shutdown_close_rounds: 3,
            shutdown_retry_delay_secs: 2,
            oracle_url: "http://127.0.0.1:8000".to_string(),
            risk: RiskParameters::default(),
            retry: RetryPolicy::default(),
            tuner: TunerConfig::default(),
        }
    }
}

impl BotConfig {
    /// Build from defaults overridden by environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        config.credentials = Credentials {
            api_key: env::var("BINANCE_API_KEY").unwrap_or_default(),
            api_secret: env::var("BINANCE_API_SECRET").unwrap_or_default(),
            telegram_token: env::var("TELEGRAM_BOT_TOKEN").ok().filter(|s| !s.is_empty()),
            telegram_chat_id: env::var("TELEGRAM_CHAT_ID").ok().filter(|s| !s.is_empty()),
        };

        override_from_env(&mut config.testnet, "BINANCE_TESTNET")?;
        override_from_env(&mut config.dry_run, "DRY_RUN")?;
        override_from_env(&mut config.paper_balance, "PAPER_BALANCE")?;
        override_from_env(&mut config.risk.max_positions, "MAX_POSITIONS")?;
        override_from_env(&mut config.risk.risk_pct, "RISK_PERCENTAGE")?;
        override_from_env(&mut config.risk.stop_loss_pct, "STOP_LOSS_PERCENTAGE")?;
        override_from_env(&mut config.risk.reward_ratio, "REWARD_RATIO")?;
        override_from_env(&mut config.risk.trailing_activation_pct, "TRAILING_ACTIVATION")?;
        override_from_env(&mut config.risk.trailing_step_pct, "TRAILING_STEP")?;
        override_from_env(&mut config.risk.use_position_cap, "USE_POSITION_CAP")?;
        override_from_env(&mut config.risk.max_hold_hours, "RISK_MAX_HOLD_HOURS")?;
        override_from_env(&mut config.daily_drawdown_limit, "DAILY_DRAWDOWN_LIMIT")?;
        override_from_env(&mut config.weekly_drawdown_limit, "WEEKLY_DRAWDOWN_LIMIT")?;
        override_from_env(&mut config.loop_interval_secs, "LOOP_INTERVAL_SECONDS")?;
        override_from_env(&mut config.balance_cache_ttl_secs, "BALANCE_CACHE_TTL")?;
        override_from_env(&mut config.tuner.mode, "BOT_LEARNING_MODE")?;

        if let Ok(url) = env::var("ORACLE_URL") {
            config.oracle_url = url;
        }
        if let Ok(list) = env::var("SYMBOLS") {
            config.symbols = split_list(&list);
        }
        if let Ok(list) = env::var("SYMBOL_BLACKLIST") {
            config.symbol_blacklist = split_list(&list);
        }
        if let Ok(list) = env::var("BLOCKED_HOURS") {
            config.blocked_hours = split_list(&list)
                .iter()
                .map(|h| h.parse::<u32>().with_context(|| format!("Invalid hour in BLOCKED_HOURS: {}", h)))
                .collect::<Result<_>>()?;
        }

        Ok(config.sanitized())
    }

    /// Apply a persisted document on top of this config, keeping credentials.
    pub fn merged_with(self, stored: BotConfig) -> Self {
        BotConfig {
            credentials: self.credentials,
            ..stored
        }
        .sanitized()
    }

    /// Clamp values into workable ranges.
    pub fn sanitized(mut self) -> Self {
        if self.loop_interval_secs < 5 {
            warn!(value = self.loop_interval_secs, "Loop interval below minimum, using 5s");
            self.loop_interval_secs = 5;
        }
        self.balance_cache_ttl_secs = self.balance_cache_ttl_secs.max(1);
        self.risk.max_positions = self.risk.max_positions.max(1);
        if self.risk.risk_pct <= Decimal::ZERO {
            self.risk.risk_pct = RiskParameters::default().risk_pct;
        }
        if self.risk.stop_loss_pct <= Decimal::ZERO {
            self.risk.stop_loss_pct = RiskParameters::default().stop_loss_pct;
        }
        if self.risk.reward_ratio <= Decimal::ZERO {
            self.risk.reward_ratio = RiskParameters::default().reward_ratio;
        }
        if self.risk.trailing_step_pct <= Decimal::ZERO {
            self.risk.trailing_step_pct = RiskParameters::default().trailing_step_pct;
        }
        self.daily_drawdown_limit = self.daily_drawdown_limit.max(Decimal::ZERO);
        self.weekly_drawdown_limit = self.weekly_drawdown_limit.max(Decimal::ZERO);
        self.shutdown_close_rounds = self.shutdown_close_rounds.max(1);
        self.blocked_hours.retain(|h| *h < 24);
        self.blocked_hours.sort_unstable();
        self.blocked_hours.dedup();
        self.symbols = normalize_symbols(&self.symbols);
        self.symbol_blacklist = normalize_symbols(&self.symbol_blacklist);
        self.tuner.smoothing = self.tuner.smoothing.clamp(0.01, 1.0);
        self.tuner.window = self.tuner.window.max(self.tuner.min_trades.max(1));
        self
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_interval_secs)
    }

    pub fn balance_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.balance_cache_ttl_secs)
    }

    pub fn is_blacklisted(&self, symbol: &str) -> bool {
        self.symbol_blacklist.iter().any(|s| s == symbol)
    }

    pub fn is_blocked_hour(&self, hour: u32) -> bool {
        self.blocked_hours.contains(&hour)
    }
}

/// Replace `target` with the parsed value of `name` when it is set.
fn override_from_env<T>(target: &mut T, name: &str) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            *target = raw
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", name, raw, e))?;
            Ok(())
        }
        _ => Ok(()),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn normalize_symbols(symbols: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for s in symbols {
        let s = s.trim().to_uppercase();
        if !s.is_empty() && !out.contains(&s) {
            out.push(s);
        }
    }
    out
}
