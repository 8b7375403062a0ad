//! Bounded self-tuning risk knobs.

use serde::{Deserialize, Serialize};

/// Identifies one tunable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunedParam {
    MinConfidence,
    StopLossMultiplier,
    TakeProfitMultiplier,
    PositionSizeMultiplier,
}

impl TunedParam {
    pub const ALL: [TunedParam; 4] = [
        TunedParam::MinConfidence,
        TunedParam::StopLossMultiplier,
        TunedParam::TakeProfitMultiplier,
        TunedParam::PositionSizeMultiplier,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TunedParam::MinConfidence => "min_confidence",
            TunedParam::StopLossMultiplier => "stop_loss_multiplier",
            TunedParam::TakeProfitMultiplier => "take_profit_multiplier",
            TunedParam::PositionSizeMultiplier => "position_size_multiplier",
        }
    }

    /// Fixed `[min, max]` range.
    pub fn bounds(&self) -> (f64, f64) {
        match self {
            TunedParam::MinConfidence => (0.3, 0.9),
            TunedParam::StopLossMultiplier => (0.5, 1.2),
            TunedParam::TakeProfitMultiplier => (0.5, 1.5),
            TunedParam::PositionSizeMultiplier => (0.5, 1.5),
        }
    }

    pub fn default_value(&self) -> f64 {
        match self {
            TunedParam::MinConfidence => 0.5,
            _ => 1.0,
        }
    }

    /// Clamp into bounds; non-finite values fall back to the default.
    pub fn clamp(&self, value: f64) -> f64 {
        if !value.is_finite() {
            return self.default_value();
        }
        let (min, max) = self.bounds();
        value.clamp(min, max)
    }
}

/// Current values of all tunable parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TunedParameters {
    /// Minimum opportunity score for entry (0.0 to 1.0)
    pub min_confidence: f64,

    /// Scales the stop distance from entry
    pub stop_loss_multiplier: f64,

    /// Scales the target distance from entry
    pub take_profit_multiplier: f64,

    /// Scales the sized notional
    pub position_size_multiplier: f64,
}

impl Default for TunedParameters {
    fn default() -> Self {
        Self {
            min_confidence: TunedParam::MinConfidence.default_value(),
            stop_loss_multiplier: TunedParam::StopLossMultiplier.default_value(),
            take_profit_multiplier: TunedParam::TakeProfitMultiplier.default_value(),
            position_size_multiplier: TunedParam::PositionSizeMultiplier.default_value(),
        }
    }
}

impl TunedParameters {
    pub fn get(&self, param: TunedParam) -> f64 {
        match param {
            TunedParam::MinConfidence => self.min_confidence,
            TunedParam::StopLossMultiplier => self.stop_loss_multiplier,
            TunedParam::TakeProfitMultiplier => self.take_profit_multiplier,
            TunedParam::PositionSizeMultiplier => self.position_size_multiplier,
        }
    }

    /// Set a value, clamped into the parameter's bounds.
    pub fn set(&mut self, param: TunedParam, value: f64) {
        let value = param.clamp(value);
        match param {
            TunedParam::MinConfidence => self.min_confidence = value,
            TunedParam::StopLossMultiplier => self.stop_loss_multiplier = value,
            TunedParam::TakeProfitMultiplier => self.take_profit_multiplier = value,
            TunedParam::PositionSizeMultiplier => self.position_size_multiplier = value,
        }
    }

    /// Copy with every value forced into bounds.
    pub fn clamped(mut self) -> Self {
        for param in TunedParam::ALL {
            self.set(param, self.get(param));
        }
        self
    }

    pub fn in_bounds(&self) -> bool {
        TunedParam::ALL.iter().all(|p| {
            let (min, max) = p.bounds();
            let v = self.get(*p);
            v >= min && v <= max
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clamps() {
        let mut params = TunedParameters::default();
        params.set(TunedParam::StopLossMultiplier, 5.0);
        assert_eq!(params.stop_loss_multiplier, 1.2);
        params.set(TunedParam::MinConfidence, -1.0);
        assert_eq!(params.min_confidence, 0.3);
        params.set(TunedParam::TakeProfitMultiplier, f64::NAN);
        assert_eq!(params.take_profit_multiplier, 1.0);
        assert!(params.in_bounds());
    }

    #[test]
    fn test_clamped_repairs_loaded_values() {
        let loaded = TunedParameters {
            min_confidence: 2.0,
            stop_loss_multiplier: 0.1,
            take_profit_multiplier: f64::INFINITY,
            position_size_multiplier: 1.1,
        };
        let fixed = loaded.clamped();
        assert!(fixed.in_bounds());
        assert_eq!(fixed.position_size_multiplier, 1.1);
    }
}
