//! Trade model: the immutable record of a closed position.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use super::{CloseReason, Side};

/// Completed round trip. Created once at close time, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Id of the position this trade closed
    pub id: String,

    pub symbol: String,

    pub side: Side,

    pub entry_price: Decimal,

    pub exit_price: Decimal,

    pub quantity: Decimal,

    /// Entry value in quote currency
    pub notional: Decimal,

    /// Realized P&L in quote currency
    pub pnl: Decimal,

    /// Realized return on entry notional, in percent
    pub return_pct: Decimal,

    pub close_reason: CloseReason,

    /// Opportunity score at entry
    pub confidence: f64,

    pub opened_at: DateTime<Utc>,

    pub closed_at: DateTime<Utc>,
}

impl Trade {
    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }

    pub fn pnl_f64(&self) -> f64 {
        self.pnl.to_f64().unwrap_or(0.0)
    }

    /// Holding time in minutes.
    pub fn duration_minutes(&self) -> i64 {
        (self.closed_at - self.opened_at).num_minutes()
    }
}
