//! Operator notifications.
//!
//! Delivery is best effort: a failed notification is logged and never
//! fails the operation that triggered it.

mod telegram;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::models::{Position, Trade};

pub use telegram::TelegramNotifier;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;
}

/// Writes notifications to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &str) -> Result<()> {
        info!(message, "Notification");
        Ok(())
    }
}

/// Message formatting plus delivery over a [`Notifier`].
#[derive(Clone)]
pub struct Notifications {
    inner: Arc<dyn Notifier>,
}

impl Notifications {
    pub fn new(inner: Arc<dyn Notifier>) -> Self {
        Self { inner }
    }

    pub fn log_only() -> Self {
        Self::new(Arc::new(LogNotifier))
    }

    /// Send in a detached task. The caller does not wait for delivery.
    pub fn fire(&self, message: String) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.send(&message).await {
                warn!(error = %e, "Notification failed");
            }
        });
    }

    /// Send and wait for delivery, swallowing failures.
    pub async fn deliver(&self, message: String) {
        if let Err(e) = self.inner.send(&message).await {
            warn!(error = %e, "Notification failed");
        }
    }

    pub fn position_opened(&self, position: &Position) {
        self.fire(format!(
            "🟢 OPENED {} {}\nEntry: {}\nQty: {}\nNotional: {}\nSL: {}\nTP: {}\nConfidence: {:.2}",
            position.side,
            position.symbol,
            position.entry_price.round_dp(8),
            position.quantity.round_dp(8),
            position.notional.round_dp(2),
            position.stop_loss.round_dp(8),
            position.take_profit.round_dp(8),
            position.confidence,
        ));
    }

    pub fn position_closed(&self, trade: &Trade) {
        let icon = if trade.is_win() { "✅" } else { "🔴" };
        self.fire(format!(
            "{} CLOSED {} {} ({})\nEntry: {}\nExit: {}\nPnL: {} ({}%)\nHeld: {} min",
            icon,
            trade.side,
            trade.symbol,
            trade.close_reason,
            trade.entry_price.round_dp(8),
            trade.exit_price.round_dp(8),
            trade.pnl.round_dp(4),
            trade.return_pct.round_dp(2),
            trade.duration_minutes(),
        ));
    }

    pub fn circuit_opened(&self, failures: u32, cooldown_secs: u64) {
        self.fire(format!(
            "⛔ Circuit breaker OPEN after {} consecutive failures. Trading paused for {}s.",
            failures, cooldown_secs
        ));
    }

    pub fn circuit_closed(&self) {
        self.fire("✅ Circuit breaker closed. Trading resumed.".to_string());
    }

    pub fn drawdown_halt(&self, reason: &str, open_symbols: &[String]) {
        let exposure = if open_symbols.is_empty() {
            "none".to_string()
        } else {
            open_symbols.join(", ")
        };
        self.fire(format!("🛑 Trading halted: {}\nOpen positions left in place: {}", reason, exposure));
    }

    pub fn bot_started(&self, testnet: bool, dry_run: bool) {
        self.fire(format!("🤖 Bot started (testnet: {}, dry run: {})", testnet, dry_run));
    }

    pub async fn bot_stopped(&self, closed: usize, unresolved: &[String]) {
        let message = if unresolved.is_empty() {
            format!("⏹ Bot stopped. Closed {} positions.", closed)
        } else {
            format!(
                "⚠️ Bot stopped with UNRESOLVED exposure. Closed {}, still open on exchange: {}",
                closed,
                unresolved.join(", ")
            )
        };
        self.deliver(message).await;
    }

    pub fn critical_error(&self, action: &str, error: &str) {
        self.fire(format!("❗ Critical error in {}: {}", action, error));
    }
}
