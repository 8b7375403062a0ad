//! Rolling performance metrics over recent closed trades.

use std::collections::{HashMap, VecDeque};

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::models::Trade;

/// Performance summary of the trade window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_trades: usize,

    pub winning_trades: usize,

    pub losing_trades: usize,

    /// Win rate in percent (0 to 100)
    pub win_rate: f64,

    /// Average profit on winning trades
    pub avg_win: f64,

    /// Average loss on losing trades (absolute value)
    pub avg_loss: f64,

    /// Mean P&L per trade
    pub expectancy: f64,

    /// Gross profit / gross loss
    pub profit_factor: f64,

    pub total_pnl: f64,

    /// Largest peak-to-trough fall of cumulative P&L, in quote currency
    pub max_drawdown: f64,

    /// Mean over standard deviation of per-trade returns
    pub sharpe_ratio: f64,
}

#[derive(Debug, Clone)]
struct Outcome {
    symbol: String,
    pnl: f64,
    return_pct: f64,
}

/// Bounded window of recent outcomes, oldest first.
#[derive(Debug, Clone)]
pub struct TradeWindow {
    capacity: usize,
    outcomes: VecDeque<Outcome>,
}

impl TradeWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            outcomes: VecDeque::new(),
        }
    }

    pub fn push(&mut self, trade: &Trade) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(Outcome {
            symbol: trade.symbol.clone(),
            pnl: trade.pnl_f64(),
            return_pct: trade.return_pct.to_f64().unwrap_or(0.0),
        });
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        let pnls: Vec<f64> = self.outcomes.iter().map(|o| o.pnl).collect();
        let returns: Vec<f64> = self.outcomes.iter().map(|o| o.return_pct).collect();
        MetricsCalculator::calculate(&pnls, &returns)
    }

    /// Standard deviation of |pnl| over the last `n` trades.
    pub fn recent_volatility(&self, n: usize) -> Option<f64> {
        if n < 2 || self.outcomes.len() < n {
            return None;
        }
        let recent: Vec<f64> = self.outcomes.iter().rev().take(n).map(|o| o.pnl.abs()).collect();
        let sd = recent.std_dev();
        sd.is_finite().then_some(sd)
    }

    /// (wins, total) per symbol.
    pub fn symbol_records(&self) -> HashMap<String, (usize, usize)> {
        let mut records: HashMap<String, (usize, usize)> = HashMap::new();
        for o in &self.outcomes {
            let entry = records.entry(o.symbol.clone()).or_default();
            if o.pnl > 0.0 {
                entry.0 += 1;
            }
            entry.1 += 1;
        }
        records
    }

    pub fn symbol_record(&self, symbol: &str) -> Option<(usize, usize)> {
        self.symbol_records().remove(symbol)
    }
}

/// Computes [`PerformanceMetrics`] from P&L series.
pub struct MetricsCalculator;

impl MetricsCalculator {
    pub fn calculate(pnls: &[f64], returns: &[f64]) -> PerformanceMetrics {
        let mut metrics = PerformanceMetrics::default();
        if pnls.is_empty() {
            return metrics;
        }

        let (wins, losses): (Vec<f64>, Vec<f64>) = pnls.iter().partition(|&&p| p > 0.0);

        metrics.total_trades = pnls.len();
        metrics.winning_trades = wins.len();
        metrics.losing_trades = losses.len();
        metrics.win_rate = wins.len() as f64 / pnls.len() as f64 * 100.0;
        metrics.total_pnl = pnls.iter().sum();
        metrics.expectancy = metrics.total_pnl / pnls.len() as f64;

        let gross_profit: f64 = wins.iter().sum();
        let gross_loss: f64 = losses.iter().map(|l| l.abs()).sum();

        if !wins.is_empty() {
            metrics.avg_win = gross_profit / wins.len() as f64;
        }
        if !losses.is_empty() {
            metrics.avg_loss = gross_loss / losses.len() as f64;
        }
        if gross_loss > 0.0 {
            metrics.profit_factor = gross_profit / gross_loss;
        }

        metrics.max_drawdown = Self::max_drawdown(pnls);

        if returns.len() >= 2 {
            let mean = returns.iter().mean();
            let std_dev = returns.iter().std_dev();
            if std_dev > 0.0 {
                metrics.sharpe_ratio = mean / std_dev;
            }
        }

        metrics
    }

    fn max_drawdown(pnls: &[f64]) -> f64 {
        let mut equity = 0.0f64;
        let mut peak = 0.0f64;
        let mut max_dd = 0.0f64;
        for pnl in pnls {
            equity += pnl;
            peak = peak.max(equity);
            max_dd = max_dd.max(peak - equity);
        }
        max_dd
    }
}
