//! Data models for positions and trades.

mod position;
mod trade;

pub use position::{CloseReason, Position, PositionStatus, Side, TrailingStop};
pub use trade::Trade;
