//! Risk parameters.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Volatility bucket reported by the signal oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolatilityRegime {
    Low,
    #[default]
    Normal,
    High,
}

/// ATR multiples for stop and target distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AtrMultipliers {
    pub stop: Decimal,
    pub target: Decimal,
}

/// Per-run risk configuration. Percentages are in percent units (2.0 = 2%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParameters {
    /// Share of balance risked per trade
    pub risk_pct: Decimal,

    /// Maximum concurrent open positions
    pub max_positions: u32,

    /// Distance from entry to the percentage stop
    pub stop_loss_pct: Decimal,

    /// Target distance as a multiple of the stop distance
    pub reward_ratio: Decimal,

    /// Profit at which the trailing stop arms
    pub trailing_activation_pct: Decimal,

    /// Base trailing distance
    pub trailing_step_pct: Decimal,

    /// Cap each position at balance / max_positions
    pub use_position_cap: bool,

    /// Reward:risk floor for ATR based stops
    pub min_reward_risk: Decimal,

    /// Widen the ATR target when reward:risk falls under the floor
    pub widen_take_profit: bool,

    /// Time stop
    pub max_hold_hours: i64,

    pub atr_low: AtrMultipliers,
    pub atr_normal: AtrMultipliers,
    pub atr_high: AtrMultipliers,
}

impl RiskParameters {
    pub fn atr_multipliers(&self, regime: VolatilityRegime) -> AtrMultipliers {
        match regime {
            VolatilityRegime::Low => self.atr_low,
            VolatilityRegime::Normal => self.atr_normal,
            VolatilityRegime::High => self.atr_high,
        }
    }
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            risk_pct: dec!(2.0),                 // 2% of balance per trade
            max_positions: 3,
            stop_loss_pct: dec!(1.5),
            reward_ratio: dec!(2.0),
            trailing_activation_pct: dec!(0.75),
            trailing_step_pct: dec!(0.5),
            use_position_cap: true,
            min_reward_risk: dec!(2.5),
            widen_take_profit: true,
            max_hold_hours: 4,
            atr_low: AtrMultipliers { stop: dec!(1.8), target: dec!(5.4) },
            atr_normal: AtrMultipliers { stop: dec!(2.0), target: dec!(6.0) },
            atr_high: AtrMultipliers { stop: dec!(2.5), target: dec!(7.5) },
        }
    }
}
