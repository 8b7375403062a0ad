//! Database persistence for the trading engine.
//!
//! Stores everything needed to resume after restart:
//! - Open and closed positions (at most one open row per symbol)
//! - Completed trades, append-only and keyed by position id
//! - Tuner snapshots, one per triggering trade
//! - The persisted configuration document

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::error;

use crate::config::BotConfig;
use crate::models::{Position, PositionStatus, Trade, TrailingStop};
use crate::tuner::TunerSnapshot;

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored position record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPosition {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub entry_price: String,
    pub quantity: String,
    pub notional: String,
    pub stop_loss: String,
    pub take_profit: String,
    pub risk_amount: String,
    pub confidence: f64,
    pub trailing_activation: String,
    pub trailing_step: String,
    pub trailing_armed: bool,
    pub trailing_factor: Option<String>,
    pub trailing_updated_at: Option<String>,
    pub status: String,
    pub opened_at: String,
}

/// Stored trade record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTrade {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub entry_price: String,
    pub exit_price: String,
    pub quantity: String,
    pub notional: String,
    pub pnl: String,
    pub return_pct: String,
    pub close_reason: String,
    pub confidence: f64,
    pub opened_at: String,
    pub closed_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredSnapshot {
    document: String,
}

impl TryFrom<StoredPosition> for Position {
    type Error = anyhow::Error;

    fn try_from(row: StoredPosition) -> Result<Self> {
        let position = Position {
            side: row.side.parse()?,
            entry_price: decimal(&row.entry_price, "entry_price")?,
            quantity: decimal(&row.quantity, "quantity")?,
            notional: decimal(&row.notional, "notional")?,
            stop_loss: decimal(&row.stop_loss, "stop_loss")?,
            take_profit: decimal(&row.take_profit, "take_profit")?,
            risk_amount: decimal(&row.risk_amount, "risk_amount")?,
            confidence: row.confidence,
            trailing: TrailingStop {
                activation_price: decimal(&row.trailing_activation, "trailing_activation")?,
                step_pct: decimal(&row.trailing_step, "trailing_step")?,
                armed: row.trailing_armed,
                factor: row
                    .trailing_factor
                    .as_deref()
                    .map(|f| decimal(f, "trailing_factor"))
                    .transpose()?,
                updated_at: row.trailing_updated_at.as_deref().map(timestamp).transpose()?,
            },
            opened_at: timestamp(&row.opened_at)?,
            status: row.status.parse()?,
            id: row.id,
            symbol: row.symbol,
        };
        position
            .validate_stored()
            .with_context(|| format!("Stored position {} is invalid", position.id))?;
        Ok(position)
    }
}

impl TryFrom<StoredTrade> for Trade {
    type Error = anyhow::Error;

    fn try_from(row: StoredTrade) -> Result<Self> {
        Ok(Trade {
            side: row.side.parse()?,
            entry_price: decimal(&row.entry_price, "entry_price")?,
            exit_price: decimal(&row.exit_price, "exit_price")?,
            quantity: decimal(&row.quantity, "quantity")?,
            notional: decimal(&row.notional, "notional")?,
            pnl: decimal(&row.pnl, "pnl")?,
            return_pct: decimal(&row.return_pct, "return_pct")?,
            close_reason: row.close_reason.parse()?,
            confidence: row.confidence,
            opened_at: timestamp(&row.opened_at)?,
            closed_at: timestamp(&row.closed_at)?,
            id: row.id,
            symbol: row.symbol,
        })
    }
}

fn decimal(raw: &str, field: &str) -> Result<Decimal> {
    Decimal::from_str(raw).with_context(|| format!("Invalid decimal in {}: {}", field, raw))
}

fn timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp: {}", raw))
}

/// Fixed-width RFC 3339 so stored timestamps compare lexicographically.
fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every connection to :memory: opens its own empty database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                notional TEXT NOT NULL,
                stop_loss TEXT NOT NULL,
                take_profit TEXT NOT NULL,
                risk_amount TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 0,
                trailing_activation TEXT NOT NULL,
                trailing_step TEXT NOT NULL,
                trailing_armed INTEGER NOT NULL DEFAULT 0,
                trailing_factor TEXT,
                trailing_updated_at TEXT,
                status TEXT NOT NULL DEFAULT 'open',
                close_reason TEXT,
                exit_price TEXT,
                pnl TEXT,
                return_pct TEXT,
                opened_at TEXT NOT NULL,
                closed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // At most one open position per symbol
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_open_symbol ON positions(symbol) WHERE status = 'open'",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                notional TEXT NOT NULL,
                pnl TEXT NOT NULL,
                return_pct TEXT NOT NULL,
                close_reason TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 0,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tuner_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trigger_trade_id TEXT UNIQUE,
                mode TEXT NOT NULL,
                win_rate REAL NOT NULL,
                document TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                document TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_closed_at ON trades(closed_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Positions ====================

    /// Get all open positions, oldest first.
    pub async fn get_open_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, StoredPosition>(
            "SELECT * FROM positions WHERE status = 'open' ORDER BY opened_at",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch positions")?;

        // A corrupt row is left in place, logged and skipped
        let positions = rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id.clone();
                match Position::try_from(row) {
                    Ok(position) => Some(position),
                    Err(e) => {
                        error!(position_id = %id, error = %e, "Skipping unreadable open position");
                        None
                    }
                }
            })
            .collect();

        Ok(positions)
    }

    /// Check for an open position on a symbol.
    pub async fn has_open_position(&self, symbol: &str) -> Result<bool> {
        let result: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM positions WHERE symbol = ? AND status = 'open'")
                .bind(symbol)
                .fetch_optional(&self.pool)
                .await?;

        Ok(result.is_some())
    }

    /// Insert a newly opened position.
    ///
    /// Returns false when another open position on the same symbol already
    /// exists, in which case nothing is written.
    pub async fn insert_position_if_absent(&self, position: &Position) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO positions (
                id, symbol, side, entry_price, quantity, notional, stop_loss, take_profit,
                risk_amount, confidence, trailing_activation, trailing_step, trailing_armed,
                trailing_factor, trailing_updated_at, status, opened_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&position.id)
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.entry_price.to_string())
        .bind(position.quantity.to_string())
        .bind(position.notional.to_string())
        .bind(position.stop_loss.to_string())
        .bind(position.take_profit.to_string())
        .bind(position.risk_amount.to_string())
        .bind(position.confidence)
        .bind(position.trailing.activation_price.to_string())
        .bind(position.trailing.step_pct.to_string())
        .bind(position.trailing.armed)
        .bind(position.trailing.factor.map(|f| f.to_string()))
        .bind(position.trailing.updated_at.map(format_ts))
        .bind(PositionStatus::Open.as_str())
        .bind(format_ts(position.opened_at))
        .execute(&self.pool)
        .await
        .context("Failed to insert position")?;

        Ok(result.rows_affected() == 1)
    }

    /// Persist the trailing-stop state and current stop of an open position.
    pub async fn update_trailing(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions SET
                stop_loss = ?,
                trailing_activation = ?,
                trailing_armed = ?,
                trailing_factor = ?,
                trailing_updated_at = ?
            WHERE id = ? AND status = 'open'
            "#,
        )
        .bind(position.stop_loss.to_string())
        .bind(position.trailing.activation_price.to_string())
        .bind(position.trailing.armed)
        .bind(position.trailing.factor.map(|f| f.to_string()))
        .bind(position.trailing.updated_at.map(format_ts))
        .bind(&position.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark a position closed and append its trade in one transaction.
    ///
    /// Returns false when the trade was already recorded.
    pub async fn close_position_with_trade(&self, trade: &Trade) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE positions SET
                status = 'closed',
                close_reason = ?,
                exit_price = ?,
                pnl = ?,
                return_pct = ?,
                closed_at = ?
            WHERE id = ? AND status = 'open'
            "#,
        )
        .bind(trade.close_reason.as_str())
        .bind(trade.exit_price.to_string())
        .bind(trade.pnl.to_string())
        .bind(trade.return_pct.to_string())
        .bind(format_ts(trade.closed_at))
        .bind(&trade.id)
        .execute(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO trades (
                id, symbol, side, entry_price, exit_price, quantity, notional,
                pnl, return_pct, close_reason, confidence, opened_at, closed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&trade.id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.entry_price.to_string())
        .bind(trade.exit_price.to_string())
        .bind(trade.quantity.to_string())
        .bind(trade.notional.to_string())
        .bind(trade.pnl.to_string())
        .bind(trade.return_pct.to_string())
        .bind(trade.close_reason.as_str())
        .bind(trade.confidence)
        .bind(format_ts(trade.opened_at))
        .bind(format_ts(trade.closed_at))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await.context("Failed to commit position close")?;

        Ok(inserted == 1)
    }

    /// Drop every open position row. Returns how many were removed.
    pub async fn delete_open_positions(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM positions WHERE status = 'open'")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // ==================== Trades ====================

    /// Most recent trades, newest first.
    pub async fn recent_trades(&self, limit: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query_as::<_, StoredTrade>(
            "SELECT * FROM trades ORDER BY closed_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch trades")?;

        rows.into_iter().map(Trade::try_from).collect()
    }

    /// Realized P&L of trades closed at or after `since`.
    pub async fn pnl_since(&self, since: DateTime<Utc>) -> Result<Decimal> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT pnl FROM trades WHERE closed_at >= ?")
            .bind(format_ts(since))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .try_fold(Decimal::ZERO, |acc, (pnl,)| -> Result<Decimal> {
                Ok(acc + decimal(pnl, "pnl")?)
            })
    }

    /// Trade count and total realized P&L.
    pub async fn trade_summary(&self) -> Result<(i64, Decimal)> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT pnl FROM trades")
            .fetch_all(&self.pool)
            .await?;

        let total = rows
            .iter()
            .try_fold(Decimal::ZERO, |acc, (pnl,)| -> Result<Decimal> {
                Ok(acc + decimal(pnl, "pnl")?)
            })?;
        Ok((rows.len() as i64, total))
    }

    // ==================== Tuner ====================

    /// Store a tuner snapshot. A second snapshot for the same trade is ignored.
    pub async fn save_tuner_snapshot(&self, snapshot: &TunerSnapshot) -> Result<()> {
        let document = serde_json::to_string(snapshot).context("Failed to encode tuner snapshot")?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO tuner_snapshots (trigger_trade_id, mode, win_rate, document, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.trigger_trade_id)
        .bind(snapshot.mode.to_string())
        .bind(snapshot.metrics.win_rate)
        .bind(document)
        .bind(format_ts(snapshot.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn latest_tuner_snapshot(&self) -> Result<Option<TunerSnapshot>> {
        let row = sqlx::query_as::<_, StoredSnapshot>(
            "SELECT document FROM tuner_snapshots ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| serde_json::from_str(&r.document).context("Failed to decode tuner snapshot"))
            .transpose()
    }

    // ==================== Config ====================

    /// Persist the configuration document. Credentials are never serialized.
    pub async fn save_config(&self, config: &BotConfig) -> Result<()> {
        let document = serde_json::to_string(config).context("Failed to encode config")?;

        sqlx::query(
            r#"
            INSERT INTO bot_config (id, document, updated_at)
            VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(document)
        .bind(format_ts(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_config(&self) -> Result<Option<BotConfig>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT document FROM bot_config WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(doc,)| {
            serde_json::from_str::<BotConfig>(&doc).map_err(|e| anyhow!("Stored config is invalid: {}", e))
        })
        .transpose()
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CloseReason, Side};
    use crate::tuner::{PerformanceMetrics, TunedParameters, TunerMode};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    async fn memory_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    fn position(id: &str, symbol: &str) -> Position {
        Position {
            id: id.to_string(),
            symbol: symbol.to_string(),
            side: Side::Long,
            entry_price: dec!(100),
            quantity: dec!(2),
            notional: dec!(200),
            stop_loss: dec!(98.5),
            take_profit: dec!(103),
            risk_amount: dec!(3),
            confidence: 0.7,
            trailing: TrailingStop {
                activation_price: dec!(100.75),
                step_pct: dec!(0.5),
                armed: false,
                factor: None,
                updated_at: None,
            },
            opened_at: Utc::now(),
            status: PositionStatus::Open,
        }
    }

    #[tokio::test]
    async fn test_second_open_on_symbol_is_rejected() {
        let db = memory_db().await;

        assert!(db.insert_position_if_absent(&position("a", "BTCUSDT")).await.unwrap());
        assert!(!db.insert_position_if_absent(&position("b", "BTCUSDT")).await.unwrap());
        assert!(db.insert_position_if_absent(&position("c", "ETHUSDT")).await.unwrap());

        let open = db.get_open_positions().await.unwrap();
        assert_eq!(open.len(), 2);
        assert!(db.has_open_position("BTCUSDT").await.unwrap());
    }

    #[tokio::test]
    async fn test_close_frees_symbol_and_is_idempotent() {
        let db = memory_db().await;
        let pos = position("a", "BTCUSDT");
        db.insert_position_if_absent(&pos).await.unwrap();

        let trade = pos.close(dec!(103), CloseReason::TakeProfit, Utc::now());
        assert!(db.close_position_with_trade(&trade).await.unwrap());
        assert!(!db.close_position_with_trade(&trade).await.unwrap());

        assert!(!db.has_open_position("BTCUSDT").await.unwrap());
        assert!(db.insert_position_if_absent(&position("b", "BTCUSDT")).await.unwrap());

        let trades = db.recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].pnl, dec!(6));
        assert_eq!(trades[0].close_reason, CloseReason::TakeProfit);
    }

    #[tokio::test]
    async fn test_trailing_update_round_trips() {
        let db = memory_db().await;
        let mut pos = position("a", "BTCUSDT");
        db.insert_position_if_absent(&pos).await.unwrap();

        pos.stop_loss = dec!(100.2);
        pos.trailing.armed = true;
        pos.trailing.factor = Some(dec!(0.9));
        pos.trailing.updated_at = Some(Utc::now());
        db.update_trailing(&pos).await.unwrap();

        let stored = db.get_open_positions().await.unwrap().remove(0);
        assert_eq!(stored.stop_loss, dec!(100.2));
        assert!(stored.trailing.armed);
        assert_eq!(stored.trailing.factor, Some(dec!(0.9)));
    }

    #[tokio::test]
    async fn test_unreadable_position_is_skipped() {
        let db = memory_db().await;
        db.insert_position_if_absent(&position("a", "BTCUSDT")).await.unwrap();
        db.insert_position_if_absent(&position("b", "ETHUSDT")).await.unwrap();

        sqlx::query("UPDATE positions SET entry_price = 'garbage' WHERE id = 'a'")
            .execute(&db.pool)
            .await
            .unwrap();

        let open = db.get_open_positions().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].symbol, "ETHUSDT");
        assert!(db.has_open_position("BTCUSDT").await.unwrap());
    }

    #[tokio::test]
    async fn test_pnl_since_window() {
        let db = memory_db().await;
        let now = Utc::now();

        let old = position("old", "BTCUSDT").close(dec!(90), CloseReason::StopLoss, now - Duration::days(3));
        let recent = position("new", "ETHUSDT").close(dec!(95), CloseReason::StopLoss, now);
        db.close_position_with_trade(&old).await.unwrap();
        db.close_position_with_trade(&recent).await.unwrap();

        assert_eq!(db.pnl_since(now - Duration::hours(1)).await.unwrap(), dec!(-10));
        assert_eq!(db.pnl_since(now - Duration::days(7)).await.unwrap(), dec!(-30));

        let (count, total) = db.trade_summary().await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(total, dec!(-30));
    }

    #[tokio::test]
    async fn test_tuner_snapshot_once_per_trade() {
        let db = memory_db().await;
        assert!(db.latest_tuner_snapshot().await.unwrap().is_none());

        let mut snapshot = TunerSnapshot {
            params: TunedParameters::default(),
            metrics: PerformanceMetrics::default(),
            mode: TunerMode::Active,
            trigger_trade_id: Some("t1".to_string()),
            created_at: Utc::now(),
        };
        db.save_tuner_snapshot(&snapshot).await.unwrap();

        snapshot.params.min_confidence = 0.8;
        db.save_tuner_snapshot(&snapshot).await.unwrap();

        let latest = db.latest_tuner_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.params.min_confidence, 0.5);
    }

    #[tokio::test]
    async fn test_config_document() {
        let db = memory_db().await;
        assert!(db.load_config().await.unwrap().is_none());

        let mut config = BotConfig::default();
        config.risk.max_positions = 5;
        db.save_config(&config).await.unwrap();
        config.risk.max_positions = 6;
        db.save_config(&config).await.unwrap();

        let stored = db.load_config().await.unwrap().unwrap();
        assert_eq!(stored.risk.max_positions, 6);
    }

    #[tokio::test]
    async fn test_delete_open_positions() {
        let db = memory_db().await;
        db.insert_position_if_absent(&position("a", "BTCUSDT")).await.unwrap();
        db.insert_position_if_absent(&position("b", "ETHUSDT")).await.unwrap();

        assert_eq!(db.delete_open_positions().await.unwrap(), 2);
        assert!(db.get_open_positions().await.unwrap().is_empty());
    }
}
