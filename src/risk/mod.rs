//! Risk engine: position sizing, stop placement, exits and trailing stops.
//!
//! Everything here is pure; callers own all I/O.

mod config;
mod exits;
mod sizing;
mod trailing;

pub use config::{AtrMultipliers, RiskParameters, VolatilityRegime};
pub use exits::{pnl, should_close};
pub use sizing::{PositionPlan, RiskEngine};
pub use trailing::advance_trailing;
