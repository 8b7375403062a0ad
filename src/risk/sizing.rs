//! Position sizing and dynamic stop/target placement.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use super::{RiskParameters, VolatilityRegime};
use crate::models::{Side, TrailingStop};

const HUNDRED: Decimal = dec!(100);

/// Result of sizing a prospective entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionPlan {
    /// Base asset quantity, exactly notional / entry
    pub quantity: Decimal,

    /// Entry value in quote currency after caps
    pub notional: Decimal,

    pub stop_loss: Decimal,

    pub take_profit: Decimal,

    /// Risk carried by the capped notional at the percentage stop
    pub risk_amount: Decimal,

    /// Risk the budget asked for before caps
    pub target_risk: Decimal,

    /// Target distance over stop distance
    pub reward_risk: Decimal,
}

impl PositionPlan {
    /// Replace the notional and recompute quantity and risk.
    pub fn with_notional(mut self, notional: Decimal, entry_price: Decimal, stop_loss_pct: Decimal) -> Self {
        self.notional = notional.max(Decimal::ZERO);
        self.quantity = if entry_price > Decimal::ZERO {
            self.notional / entry_price
        } else {
            Decimal::ZERO
        };
        self.risk_amount = self.notional * stop_loss_pct / HUNDRED;
        self
    }

    /// Replace stop and target, keeping reward_risk consistent.
    pub fn with_levels(mut self, entry_price: Decimal, stop_loss: Decimal, take_profit: Decimal) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self.reward_risk = reward_risk(entry_price, stop_loss, take_profit);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.quantity <= Decimal::ZERO
    }
}

/// Pure risk calculations over a fixed parameter set.
#[derive(Debug, Clone)]
pub struct RiskEngine {
    params: RiskParameters,
}

impl RiskEngine {
    pub fn new(params: RiskParameters) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &RiskParameters {
        &self.params
    }

    /// Size a position so that hitting the percentage stop loses at most
    /// `risk_pct` of balance, subject to balance and per-slot caps.
    ///
    /// Degenerate inputs (zero balance, zero price) produce an empty plan
    /// instead of an error.
    pub fn size_position(
        &self,
        balance: Decimal,
        entry_price: Decimal,
        side: Side,
        atr: Option<Decimal>,
        regime: VolatilityRegime,
    ) -> PositionPlan {
        let (stop_loss, take_profit) = self.dynamic_stops(entry_price, side, atr, regime);

        match self.try_size(balance, entry_price) {
            Some((quantity, notional, risk_amount, target_risk)) => PositionPlan {
                quantity,
                notional,
                stop_loss,
                take_profit,
                risk_amount,
                target_risk,
                reward_risk: reward_risk(entry_price, stop_loss, take_profit),
            },
            None => PositionPlan {
                quantity: Decimal::ZERO,
                notional: Decimal::ZERO,
                stop_loss,
                take_profit,
                risk_amount: Decimal::ZERO,
                target_risk: Decimal::ZERO,
                reward_risk: reward_risk(entry_price, stop_loss, take_profit),
            },
        }
    }

    fn try_size(&self, balance: Decimal, entry_price: Decimal) -> Option<(Decimal, Decimal, Decimal, Decimal)> {
        let p = &self.params;
        if balance <= Decimal::ZERO || entry_price <= Decimal::ZERO || p.stop_loss_pct <= Decimal::ZERO {
            return None;
        }

        let stop_frac = p.stop_loss_pct / HUNDRED;
        let target_risk = balance.checked_mul(p.risk_pct / HUNDRED)?;
        let theoretical = target_risk.checked_div(stop_frac)?;

        let mut notional = theoretical.min(balance);
        if p.use_position_cap {
            let slots = Decimal::from(p.max_positions.max(1));
            notional = notional.min(balance / slots);
        }

        let quantity = notional.checked_div(entry_price)?;
        let effective_risk = notional.checked_mul(stop_frac)?;

        if effective_risk < target_risk * dec!(0.9) {
            warn!(
                target_risk = %target_risk.round_dp(4),
                effective_risk = %effective_risk.round_dp(4),
                notional = %notional.round_dp(4),
                "Risk under-funded by position caps"
            );
        }

        Some((quantity, notional, effective_risk, target_risk))
    }

    /// Stop and target prices for an entry.
    ///
    /// With a positive ATR the regime multipliers apply; otherwise the
    /// percentage stop and reward ratio do.
    pub fn dynamic_stops(
        &self,
        entry_price: Decimal,
        side: Side,
        atr: Option<Decimal>,
        regime: VolatilityRegime,
    ) -> (Decimal, Decimal) {
        let p = &self.params;
        let sign = direction(side);

        if let Some(atr) = atr.filter(|a| *a > Decimal::ZERO) {
            let mult = p.atr_multipliers(regime);
            let risk = atr * mult.stop;
            let mut reward = atr * mult.target;

            if risk > Decimal::ZERO && reward / risk < p.min_reward_risk && p.widen_take_profit {
                let widened = risk * p.min_reward_risk;
                info!(
                    ?regime,
                    reward_risk = %(reward / risk).round_dp(2),
                    floor = %p.min_reward_risk,
                    original_target = %(entry_price + sign * reward),
                    widened_target = %(entry_price + sign * widened),
                    "Widening take-profit to restore reward:risk floor"
                );
                reward = widened;
            }

            let stop = entry_price - sign * risk;
            if stop > Decimal::ZERO {
                return (stop, entry_price + sign * reward);
            }
        }

        let stop_distance = entry_price * p.stop_loss_pct / HUNDRED;
        (
            entry_price - sign * stop_distance,
            entry_price + sign * stop_distance * p.reward_ratio,
        )
    }

    /// Whether a position has been held past the time stop.
    pub fn should_close_by_time(&self, opened_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.params.max_hold_hours > 0 && now - opened_at >= Duration::hours(self.params.max_hold_hours)
    }

    /// Price at which the trailing stop arms.
    pub fn trailing_activation(&self, entry_price: Decimal, side: Side) -> Decimal {
        entry_price * (Decimal::ONE + direction(side) * self.params.trailing_activation_pct / HUNDRED)
    }

    /// Fresh trailing-stop state for a new entry.
    pub fn trailing_for(&self, entry_price: Decimal, side: Side) -> TrailingStop {
        TrailingStop {
            activation_price: self.trailing_activation(entry_price, side),
            step_pct: self.params.trailing_step_pct,
            armed: false,
            factor: None,
            updated_at: None,
        }
    }
}

pub(super) fn direction(side: Side) -> Decimal {
    match side {
        Side::Long => Decimal::ONE,
        Side::Short => Decimal::NEGATIVE_ONE,
    }
}

fn reward_risk(entry_price: Decimal, stop_loss: Decimal, take_profit: Decimal) -> Decimal {
    let risk = (entry_price - stop_loss).abs();
    if risk.is_zero() {
        return Decimal::ZERO;
    }
    (take_profit - entry_price).abs() / risk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::AtrMultipliers;

    fn engine() -> RiskEngine {
        RiskEngine::new(RiskParameters::default())
    }

    #[test]
    fn test_capped_by_slot() {
        // B=1000, R=2%, S=1.5%, M=3: theoretical 1333.33 capped to 333.33
        let plan = engine().size_position(dec!(1000), dec!(50), Side::Long, None, VolatilityRegime::Normal);
        assert_eq!(plan.notional, dec!(1000) / dec!(3));
        assert_eq!(plan.quantity, plan.notional / dec!(50));
        assert_eq!(plan.target_risk, dec!(20));
        assert_eq!(plan.notional.round_dp(2), dec!(333.33));
    }

    #[test]
    fn test_notional_formula_over_grid() {
        let balances = [dec!(50), dec!(1000), dec!(12345.67)];
        let risks = [dec!(0.5), dec!(2), dec!(5)];
        let stops = [dec!(0.8), dec!(1.5), dec!(10)];
        let slots = [1u32, 3, 10];

        for &b in &balances {
            for &r in &risks {
                for &s in &stops {
                    for &m in &slots {
                        let params = RiskParameters {
                            risk_pct: r,
                            stop_loss_pct: s,
                            max_positions: m,
                            ..RiskParameters::default()
                        };
                        let plan = RiskEngine::new(params).size_position(
                            b, dec!(7), Side::Long, None, VolatilityRegime::Normal,
                        );
                        let theoretical = (b * r / dec!(100)) / (s / dec!(100));
                        let expected = theoretical.min(b).min(b / Decimal::from(m));
                        assert_eq!(plan.notional, expected);
                        assert_eq!(plan.quantity, expected / dec!(7));
                    }
                }
            }
        }
    }

    #[test]
    fn test_uncapped_uses_balance() {
        let params = RiskParameters {
            use_position_cap: false,
            ..RiskParameters::default()
        };
        let plan = RiskEngine::new(params).size_position(dec!(1000), dec!(10), Side::Long, None, VolatilityRegime::Normal);
        assert_eq!(plan.notional, dec!(1000));
    }

    #[test]
    fn test_degenerate_inputs_yield_empty_plan() {
        let e = engine();
        assert!(e.size_position(Decimal::ZERO, dec!(10), Side::Long, None, VolatilityRegime::Normal).is_empty());
        assert!(e.size_position(dec!(-5), dec!(10), Side::Long, None, VolatilityRegime::Normal).is_empty());
        assert!(e.size_position(dec!(1000), Decimal::ZERO, Side::Long, None, VolatilityRegime::Normal).is_empty());
    }

    #[test]
    fn test_percentage_stops() {
        let (sl, tp) = engine().dynamic_stops(dec!(100), Side::Long, None, VolatilityRegime::Normal);
        assert_eq!(sl, dec!(98.5));
        assert_eq!(tp, dec!(103));

        let (sl, tp) = engine().dynamic_stops(dec!(100), Side::Short, None, VolatilityRegime::Normal);
        assert_eq!(sl, dec!(101.5));
        assert_eq!(tp, dec!(97));
    }

    #[test]
    fn test_atr_stops_by_regime() {
        let e = engine();
        let (sl, tp) = e.dynamic_stops(dec!(100), Side::Long, Some(dec!(1)), VolatilityRegime::High);
        assert_eq!((sl, tp), (dec!(97.5), dec!(107.5)));

        let (sl, tp) = e.dynamic_stops(dec!(100), Side::Long, Some(dec!(1)), VolatilityRegime::Low);
        assert_eq!((sl, tp), (dec!(98.2), dec!(105.4)));

        let (sl, tp) = e.dynamic_stops(dec!(100), Side::Short, Some(dec!(1)), VolatilityRegime::Normal);
        assert_eq!((sl, tp), (dec!(102), dec!(94)));
    }

    #[test]
    fn test_take_profit_widened_to_floor() {
        let params = RiskParameters {
            atr_normal: AtrMultipliers { stop: dec!(2), target: dec!(4) },
            ..RiskParameters::default()
        };
        let e = RiskEngine::new(params.clone());
        let (sl, tp) = e.dynamic_stops(dec!(100), Side::Long, Some(dec!(1)), VolatilityRegime::Normal);
        assert_eq!(sl, dec!(98));
        assert_eq!(tp, dec!(105));

        let keep = RiskEngine::new(RiskParameters { widen_take_profit: false, ..params });
        let (_, tp) = keep.dynamic_stops(dec!(100), Side::Long, Some(dec!(1)), VolatilityRegime::Normal);
        assert_eq!(tp, dec!(104));
    }

    #[test]
    fn test_oversized_atr_falls_back_to_percentage() {
        let (sl, _) = engine().dynamic_stops(dec!(1), Side::Long, Some(dec!(5)), VolatilityRegime::Normal);
        assert_eq!(sl, dec!(0.985));
    }

    #[test]
    fn test_time_stop() {
        let e = engine();
        let now = Utc::now();
        assert!(!e.should_close_by_time(now - Duration::hours(3), now));
        assert!(e.should_close_by_time(now - Duration::hours(4), now));
    }

    #[test]
    fn test_trailing_activation() {
        let t = engine().trailing_for(dec!(100), Side::Long);
        assert_eq!(t.activation_price, dec!(100.75));
        let t = engine().trailing_for(dec!(100), Side::Short);
        assert_eq!(t.activation_price, dec!(99.25));
        assert!(!t.armed);
    }
}
