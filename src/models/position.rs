//! Position model: one open exposure to a traded symbol.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Trade;
use crate::risk;

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Long,
    #[serde(rename = "SELL")]
    Short,
}

impl Side {
    /// Exchange order side string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "BUY",
            Side::Short => "SELL",
        }
    }

    /// Side of the order that flattens a position of this direction.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "BUY" | "LONG" => Ok(Side::Long),
            "SELL" | "SHORT" => Ok(Side::Short),
            other => bail!("Unknown side: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

impl FromStr for PositionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(PositionStatus::Open),
            "closed" => Ok(PositionStatus::Closed),
            other => bail!("Unknown position status: {}", other),
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    TimeStop,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::StopLoss => "STOP_LOSS",
            CloseReason::TakeProfit => "TAKE_PROFIT",
            CloseReason::TimeStop => "TIME_STOP",
            CloseReason::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloseReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "STOP_LOSS" => Ok(CloseReason::StopLoss),
            "TAKE_PROFIT" => Ok(CloseReason::TakeProfit),
            "TIME_STOP" => Ok(CloseReason::TimeStop),
            "SHUTDOWN" => Ok(CloseReason::Shutdown),
            other => bail!("Unknown close reason: {}", other),
        }
    }
}

/// Trailing-stop sub-state carried by each position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingStop {
    /// Price that arms (and later ratchets) the trail
    pub activation_price: Decimal,

    /// Base trailing step in percent
    pub step_pct: Decimal,

    /// Set once price has crossed the activation price
    pub armed: bool,

    /// Tightening factor applied on the last update
    pub factor: Option<Decimal>,

    pub updated_at: Option<DateTime<Utc>>,
}

/// An open (or just closed) exposure to one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Stable identifier, reused as the trade id on close
    pub id: String,

    pub symbol: String,

    pub side: Side,

    /// Average fill price of the entry order
    pub entry_price: Decimal,

    /// Base asset quantity
    pub quantity: Decimal,

    /// Entry value in quote currency
    pub notional: Decimal,

    pub stop_loss: Decimal,

    pub take_profit: Decimal,

    /// Quote amount lost if the initial stop is hit
    pub risk_amount: Decimal,

    /// Opportunity score the entry was admitted with (0.0 to 1.0)
    pub confidence: f64,

    pub trailing: TrailingStop,

    pub opened_at: DateTime<Utc>,

    pub status: PositionStatus,
}

impl Position {
    /// Check a freshly opened position: stop and target on the correct side
    /// of entry.
    pub fn validate(&self) -> Result<()> {
        self.check_amounts()?;
        let ordered = match self.side {
            Side::Long => self.stop_loss < self.entry_price && self.take_profit > self.entry_price,
            Side::Short => self.stop_loss > self.entry_price && self.take_profit < self.entry_price,
        };
        if !ordered {
            bail!(
                "{}: stop {} / target {} on wrong side of entry {} for {}",
                self.symbol,
                self.stop_loss,
                self.take_profit,
                self.entry_price,
                self.side
            );
        }
        Ok(())
    }

    /// Check a position loaded from the store.
    ///
    /// An armed trailing stop may have moved past entry to lock in profit,
    /// so only the target side and a positive stop are checked.
    pub fn validate_stored(&self) -> Result<()> {
        if !self.trailing.armed {
            return self.validate();
        }
        self.check_amounts()?;
        let ordered = self.stop_loss > Decimal::ZERO
            && match self.side {
                Side::Long => self.take_profit > self.entry_price,
                Side::Short => self.take_profit > Decimal::ZERO && self.take_profit < self.entry_price,
            };
        if !ordered {
            bail!(
                "{}: trailed stop {} / target {} invalid around entry {} for {}",
                self.symbol,
                self.stop_loss,
                self.take_profit,
                self.entry_price,
                self.side
            );
        }
        Ok(())
    }

    fn check_amounts(&self) -> Result<()> {
        if self.entry_price <= Decimal::ZERO {
            bail!("{}: entry price must be positive", self.symbol);
        }
        if self.quantity <= Decimal::ZERO {
            bail!("{}: quantity must be positive", self.symbol);
        }
        Ok(())
    }

    /// Unrealized profit in percent at the given price.
    pub fn profit_pct(&self, price: Decimal) -> Decimal {
        risk::pnl(self.entry_price, price, self.quantity, self.side).return_pct
    }

    /// Turn this position into its immutable trade record.
    pub fn close(mut self, exit_price: Decimal, reason: CloseReason, at: DateTime<Utc>) -> Trade {
        let outcome = risk::pnl(self.entry_price, exit_price, self.quantity, self.side);
        self.status = PositionStatus::Closed;
        Trade {
            id: self.id,
            symbol: self.symbol,
            side: self.side,
            entry_price: self.entry_price,
            exit_price,
            quantity: self.quantity,
            notional: self.notional,
            pnl: outcome.pnl,
            return_pct: outcome.return_pct,
            close_reason: reason,
            confidence: self.confidence,
            opened_at: self.opened_at,
            closed_at: at,
        }
    }
}
