//! Adaptive tuner: nudges bounded risk knobs after every closed trade.
//!
//! Modes:
//! - `active`: derives targets, smooths toward them and applies the result
//! - `observe`: derives and logs the counterfactual, never applies
//! - `disabled`: pass-through
//!
//! Accepted updates are snapshotted. The rollback baseline only advances
//! while win rate holds; once win rate falls by the rollback threshold
//! below the baseline, its parameters are restored wholesale.

mod metrics;
mod params;

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::Trade;

pub use metrics::{PerformanceMetrics, TradeWindow};
pub use params::{TunedParam, TunedParameters};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunerMode {
    #[default]
    Active,
    Observe,
    Disabled,
}

impl TunerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunerMode::Active => "active",
            TunerMode::Observe => "observe",
            TunerMode::Disabled => "disabled",
        }
    }
}

impl fmt::Display for TunerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(TunerMode::Active),
            "observe" => Ok(TunerMode::Observe),
            "disabled" | "off" => Ok(TunerMode::Disabled),
            other => bail!("Unknown learning mode: {}", other),
        }
    }
}

/// Tuner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    pub mode: TunerMode,

    /// EMA weight given to the new target (0.0 to 1.0)
    pub smoothing: f64,

    /// Closed trades required before any adjustment
    pub min_trades: usize,

    /// Win-rate drop (percentage points) that triggers a rollback
    pub rollback_threshold: f64,

    /// Trades kept in the rolling window
    pub window: usize,

    /// Changes at or below this are not reported as updates
    pub min_change: f64,

    /// Average loss (quote) above which stops tighten
    pub large_loss: f64,

    /// Average win (quote) below which targets widen
    pub small_win: f64,

    /// Recent |pnl| dispersion above which size shrinks
    pub high_volatility: f64,

    /// Recent |pnl| dispersion below which size grows after a win
    pub low_volatility: f64,

    /// Trades on a symbol before its own win rate gates entry
    pub min_symbol_trades: usize,

    /// Symbols below this win rate (percent) are skipped
    pub min_symbol_win_rate: f64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            mode: TunerMode::Active,
            smoothing: 0.15,
            min_trades: 20,
            rollback_threshold: 10.0,
            window: 500,
            min_change: 0.001,
            large_loss: 50.0,
            small_win: 30.0,
            high_volatility: 50.0,
            low_volatility: 20.0,
            min_symbol_trades: 10,
            min_symbol_win_rate: 30.0,
        }
    }
}

/// Parameters plus the metrics they were accepted under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunerSnapshot {
    pub params: TunedParameters,
    pub metrics: PerformanceMetrics,
    pub mode: TunerMode,
    /// Trade whose close produced this snapshot
    pub trigger_trade_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamChange {
    pub param: TunedParam,
    pub from: f64,
    pub to: f64,
}

/// What a closed trade did to the tuner.
#[derive(Debug, Clone, Default)]
pub struct TunerUpdate {
    pub changes: Vec<ParamChange>,
    /// Changes were written to the live parameters
    pub applied: bool,
    pub rolled_back: bool,
    /// Snapshot to persist, if any
    pub snapshot: Option<TunerSnapshot>,
}

pub struct AdaptiveTuner {
    config: TunerConfig,
    params: TunedParameters,
    window: TradeWindow,
    baseline: Option<TunerSnapshot>,
}

impl AdaptiveTuner {
    pub fn new(config: TunerConfig) -> Self {
        let window = TradeWindow::new(config.window);
        Self {
            config,
            params: TunedParameters::default(),
            window,
            baseline: None,
        }
    }

    pub fn mode(&self) -> TunerMode {
        self.config.mode
    }

    /// Live parameters used for sizing.
    pub fn params(&self) -> TunedParameters {
        self.params
    }

    /// Reload persisted state: the latest snapshot and recent history (oldest first).
    pub fn restore(&mut self, snapshot: Option<TunerSnapshot>, history: &[Trade]) {
        for trade in history {
            self.window.push(trade);
        }
        if let Some(mut snapshot) = snapshot {
            if !snapshot.params.in_bounds() {
                warn!(params = ?snapshot.params, "Stored tuner parameters out of bounds, clamping");
            }
            snapshot.params = snapshot.params.clamped();
            self.params = snapshot.params;
            self.baseline = Some(snapshot);
        }
        info!(
            mode = %self.config.mode,
            trades = self.window.len(),
            min_confidence = self.params.min_confidence,
            sl_mult = self.params.stop_loss_multiplier,
            tp_mult = self.params.take_profit_multiplier,
            size_mult = self.params.position_size_multiplier,
            "Tuner restored"
        );
    }

    /// One EMA step from `current` toward `target`, clamped to bounds.
    fn smoothed(&self, param: TunedParam, current: f64, target: f64) -> f64 {
        let alpha = self.config.smoothing.clamp(0.0, 1.0);
        param.clamp(alpha * target + (1.0 - alpha) * current)
    }

    /// Feed a closed trade and adjust parameters.
    pub fn on_trade_closed(&mut self, trade: &Trade) -> TunerUpdate {
        if self.config.mode == TunerMode::Disabled {
            return TunerUpdate::default();
        }

        self.window.push(trade);
        let metrics = self.window.metrics();

        if metrics.total_trades < self.config.min_trades {
            debug!(
                trades = metrics.total_trades,
                required = self.config.min_trades,
                "Not enough trades to tune"
            );
            return TunerUpdate::default();
        }

        let mut candidate = self.params;
        let mut changes = Vec::new();
        for (param, target) in self.targets(&metrics, trade) {
            let from = candidate.get(param);
            let to = self.smoothed(param, from, target);
            candidate.set(param, to);
            if (to - from).abs() > self.config.min_change {
                changes.push(ParamChange { param, from, to });
            }
        }

        if self.config.mode == TunerMode::Observe {
            for change in &changes {
                info!(
                    param = change.param.name(),
                    current = change.from,
                    would_be = change.to,
                    win_rate = metrics.win_rate,
                    "[OBSERVE] Parameter update not applied"
                );
            }
            return TunerUpdate { changes, ..TunerUpdate::default() };
        }

        self.params = candidate;

        if changes.is_empty() {
            return TunerUpdate::default();
        }

        if let Some(baseline) = &self.baseline {
            let drop = baseline.metrics.win_rate - metrics.win_rate;
            if metrics.total_trades >= self.config.min_trades && drop >= self.config.rollback_threshold {
                warn!(
                    baseline_win_rate = baseline.metrics.win_rate,
                    win_rate = metrics.win_rate,
                    "Win rate regressed, rolling back tuned parameters"
                );
                self.params = baseline.params;
                let snapshot = self.snapshot(metrics, trade);
                self.baseline = Some(snapshot.clone());
                return TunerUpdate {
                    changes,
                    applied: true,
                    rolled_back: true,
                    snapshot: Some(snapshot),
                };
            }
        }

        for change in &changes {
            info!(param = change.param.name(), from = change.from, to = change.to, "Tuned parameter");
        }

        let snapshot = self.snapshot(metrics, trade);
        let advance = self
            .baseline
            .as_ref()
            .map_or(true, |b| snapshot.metrics.win_rate >= b.metrics.win_rate);
        if advance {
            self.baseline = Some(snapshot.clone());
        }

        TunerUpdate {
            changes,
            applied: true,
            rolled_back: false,
            snapshot: Some(snapshot),
        }
    }

    fn snapshot(&self, metrics: PerformanceMetrics, trade: &Trade) -> TunerSnapshot {
        TunerSnapshot {
            params: self.params,
            metrics,
            mode: self.config.mode,
            trigger_trade_id: Some(trade.id.clone()),
            created_at: Utc::now(),
        }
    }

    /// Rule-derived targets for the current metrics and the trade just closed.
    fn targets(&self, m: &PerformanceMetrics, trade: &Trade) -> Vec<(TunedParam, f64)> {
        let c = &self.config;
        let p = &self.params;
        let win = trade.is_win();
        let mut targets = Vec::new();

        if m.win_rate < 40.0 {
            targets.push((TunedParam::MinConfidence, p.min_confidence + 0.05));
        } else if m.win_rate > 65.0 {
            targets.push((TunedParam::MinConfidence, p.min_confidence - 0.02));
        }

        if !win && m.avg_loss > c.large_loss {
            targets.push((TunedParam::StopLossMultiplier, p.stop_loss_multiplier - 0.05));
        }

        if win && m.avg_win < c.small_win {
            targets.push((TunedParam::TakeProfitMultiplier, p.take_profit_multiplier + 0.05));
        }

        if let Some(volatility) = self.window.recent_volatility(5) {
            if volatility > c.high_volatility {
                targets.push((TunedParam::PositionSizeMultiplier, p.position_size_multiplier - 0.05));
            } else if volatility < c.low_volatility && win {
                targets.push((TunedParam::PositionSizeMultiplier, p.position_size_multiplier + 0.02));
            }
        }

        targets
    }

    fn multiplier(&self, value: f64) -> Decimal {
        if self.config.mode == TunerMode::Disabled {
            return Decimal::ONE;
        }
        Decimal::from_f64(value).unwrap_or(Decimal::ONE)
    }

    /// Scale the stop distance from entry.
    pub fn adjust_stop_loss(&self, stop: Decimal, entry: Decimal) -> Decimal {
        entry + (stop - entry) * self.multiplier(self.params.stop_loss_multiplier)
    }

    /// Scale the target distance from entry.
    pub fn adjust_take_profit(&self, target: Decimal, entry: Decimal) -> Decimal {
        entry + (target - entry) * self.multiplier(self.params.take_profit_multiplier)
    }

    pub fn adjust_position_size(&self, notional: Decimal) -> Decimal {
        notional * self.multiplier(self.params.position_size_multiplier)
    }

    /// Oracle strength (0-100) blended with the symbol's own record.
    pub fn opportunity_score(&self, symbol: &str, strength: f64) -> f64 {
        let mut score = (strength / 100.0).clamp(0.0, 1.0);
        if let Some((wins, total)) = self.window.symbol_record(symbol) {
            if total >= 5 {
                score += (wins as f64 / total as f64 - 0.5) * 0.2;
            }
        }
        score.clamp(0.0, 1.0)
    }

    /// Admission check for a scored candidate.
    pub fn should_take_trade(&self, symbol: &str, score: f64) -> bool {
        if self.config.mode == TunerMode::Disabled {
            return score >= TunedParam::MinConfidence.default_value();
        }
        if score < self.params.min_confidence {
            return false;
        }
        if let Some((wins, total)) = self.window.symbol_record(symbol) {
            let win_rate = wins as f64 / total as f64 * 100.0;
            if total >= self.config.min_symbol_trades && win_rate < self.config.min_symbol_win_rate {
                debug!(symbol, win_rate, total, "Symbol pattern below win-rate floor");
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CloseReason, Side};
    use rust_decimal_macros::dec;

    fn make_trade(id: usize, symbol: &str, pnl: Decimal) -> Trade {
        Trade {
            id: format!("trade-{}", id),
            symbol: symbol.to_string(),
            side: Side::Long,
            entry_price: dec!(100),
            exit_price: dec!(100) + pnl,
            quantity: dec!(1),
            notional: dec!(100),
            pnl,
            return_pct: pnl,
            close_reason: if pnl > Decimal::ZERO { CloseReason::TakeProfit } else { CloseReason::StopLoss },
            confidence: 0.7,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
        }
    }

    fn tuner(mode: TunerMode) -> AdaptiveTuner {
        AdaptiveTuner::new(TunerConfig { mode, ..TunerConfig::default() })
    }

    #[test]
    fn test_no_adjustment_before_min_trades() {
        let mut t = tuner(TunerMode::Active);
        for i in 0..19 {
            let update = t.on_trade_closed(&make_trade(i, "BTCUSDT", dec!(-10)));
            assert!(update.changes.is_empty());
        }
        assert_eq!(t.params(), TunedParameters::default());
    }

    #[test]
    fn test_low_win_rate_raises_confidence() {
        let mut t = tuner(TunerMode::Active);
        let mut last = TunerUpdate::default();
        for i in 0..20 {
            last = t.on_trade_closed(&make_trade(i, "BTCUSDT", dec!(-10)));
        }
        assert!(last.applied);
        assert!(t.params().min_confidence > 0.5);
        assert!(last.snapshot.is_some());
    }

    #[test]
    fn test_ema_converges_to_target() {
        let t = tuner(TunerMode::Active);
        let target = 1.3;
        let mut value = 1.0;
        for _ in 0..200 {
            value = t.smoothed(TunedParam::TakeProfitMultiplier, value, target);
        }
        assert!((value - target).abs() < 1e-6);

        // First step moves exactly alpha of the way.
        let first = t.smoothed(TunedParam::TakeProfitMultiplier, 1.0, 1.2);
        assert!((first - (0.15 * 1.2 + 0.85 * 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_bounds_hold_under_adversarial_targets() {
        let mut t = tuner(TunerMode::Active);
        let extremes = [1e12, -1e12, f64::INFINITY, f64::NEG_INFINITY, f64::NAN, 0.0, 7.0];
        for round in 0..50 {
            for param in TunedParam::ALL {
                let next = t.smoothed(param, t.params.get(param), extremes[round % extremes.len()]);
                t.params.set(param, next);
                assert!(t.params().in_bounds(), "{:?} out of bounds", t.params());
            }
        }

        let mut t = tuner(TunerMode::Active);
        for i in 0..600 {
            let pnl = if i % 3 == 0 { dec!(500) } else { dec!(-900) };
            t.on_trade_closed(&make_trade(i, "ETHUSDT", pnl));
            assert!(t.params().in_bounds());
        }
    }

    #[test]
    fn test_observe_never_mutates_live_params() {
        let mut t = tuner(TunerMode::Observe);
        let mut saw_counterfactual = false;
        for i in 0..60 {
            let update = t.on_trade_closed(&make_trade(i, "BTCUSDT", dec!(-80)));
            saw_counterfactual |= !update.changes.is_empty();
            assert!(!update.applied);
            assert!(update.snapshot.is_none());
        }
        assert!(saw_counterfactual);
        assert_eq!(t.params(), TunedParameters::default());
    }

    #[test]
    fn test_disabled_is_pass_through() {
        let mut t = tuner(TunerMode::Disabled);
        for i in 0..30 {
            assert!(t.on_trade_closed(&make_trade(i, "BTCUSDT", dec!(-80))).changes.is_empty());
        }
        assert_eq!(t.adjust_stop_loss(dec!(98), dec!(100)), dec!(98));
        assert_eq!(t.adjust_position_size(dec!(250)), dec!(250));
        assert!(t.should_take_trade("BTCUSDT", 0.5));
        assert!(!t.should_take_trade("BTCUSDT", 0.49));
    }

    #[test]
    fn test_rollback_on_win_rate_regression() {
        let mut t = tuner(TunerMode::Active);
        let mut baseline = None;
        for i in 0..20 {
            let update = t.on_trade_closed(&make_trade(i, "BTCUSDT", dec!(10)));
            if update.snapshot.is_some() {
                baseline = update.snapshot;
            }
        }
        let baseline = baseline.expect("snapshot after twentieth trade");
        assert_eq!(baseline.metrics.win_rate, 100.0);

        let mut rolled_back = false;
        for i in 20..26 {
            let update = t.on_trade_closed(&make_trade(i, "BTCUSDT", dec!(-10)));
            if update.rolled_back {
                rolled_back = true;
                break;
            }
        }
        assert!(rolled_back);
        assert_eq!(t.params(), baseline.params);
    }

    #[test]
    fn test_no_rollback_without_accepted_update() {
        let mut t = tuner(TunerMode::Active);
        let history: Vec<Trade> = (0..20)
            .map(|i| make_trade(i, "BTCUSDT", if i % 2 == 0 { dec!(40) } else { dec!(-40) }))
            .collect();
        t.restore(
            Some(TunerSnapshot {
                params: TunedParameters::default(),
                metrics: PerformanceMetrics { win_rate: 80.0, ..PerformanceMetrics::default() },
                mode: TunerMode::Active,
                trigger_trade_id: None,
                created_at: Utc::now(),
            }),
            &history,
        );

        // Win rate 47.6% is 32 points under the baseline, but no rule fires
        let update = t.on_trade_closed(&make_trade(20, "BTCUSDT", dec!(-40)));
        assert!(update.changes.is_empty());
        assert!(!update.rolled_back);
        assert!(update.snapshot.is_none());
    }

    #[test]
    fn test_adjustments_scale_distance() {
        let mut t = tuner(TunerMode::Active);
        t.restore(
            Some(TunerSnapshot {
                params: TunedParameters {
                    stop_loss_multiplier: 0.5,
                    take_profit_multiplier: 1.5,
                    position_size_multiplier: 0.5,
                    ..TunedParameters::default()
                },
                metrics: PerformanceMetrics::default(),
                mode: TunerMode::Active,
                trigger_trade_id: None,
                created_at: Utc::now(),
            }),
            &[],
        );
        assert_eq!(t.adjust_stop_loss(dec!(98), dec!(100)), dec!(99));
        assert_eq!(t.adjust_take_profit(dec!(104), dec!(100)), dec!(106));
        assert_eq!(t.adjust_position_size(dec!(300)), dec!(150));
        // short: stop above entry stays above
        assert_eq!(t.adjust_stop_loss(dec!(102), dec!(100)), dec!(101));
    }

    #[test]
    fn test_symbol_pattern_blocks_entry() {
        let mut t = tuner(TunerMode::Active);
        let history: Vec<Trade> = (0..10)
            .map(|i| make_trade(i, "DOGEUSDT", if i < 2 { dec!(5) } else { dec!(-5) }))
            .collect();
        t.restore(None, &history);
        assert!(!t.should_take_trade("DOGEUSDT", 0.95));
        assert!(t.should_take_trade("BTCUSDT", 0.95));
        assert!(t.opportunity_score("DOGEUSDT", 80.0) < 0.8);
    }
}
