//! Bot runner: the control loop and its lifecycle.
//!
//! Each tick:
//! - Reloads open positions from the store
//! - Advances trailing stops and closes positions whose exit fired
//! - Feeds closed trades to the tuner
//! - Admits at most one new entry when a slot is free

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, Timelike, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BotConfig;
use crate::db::Database;
use crate::error::BotError;
use crate::exchange::{CircuitStatus, Exchange, OrderRequest, ResilientClient};
use crate::models::{CloseReason, Position, PositionStatus, Side, Trade};
use crate::notify::Notifications;
use crate::oracle::{Analysis, Signal, SignalOracle};
use crate::risk::{self, PositionPlan, RiskEngine};
use crate::tuner::{AdaptiveTuner, TunedParameters, TunerMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Stopped => "Stopped",
            Lifecycle::Starting => "Starting",
            Lifecycle::Running => "Running",
            Lifecycle::Stopping => "Stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Nothing to clean up
    Clean,
    /// Stale orders or positions were removed
    Cleaned,
    /// Some cancels failed or the exchange was unreachable; run again
    Retry,
    /// The exchange refused the query
    Error,
}

/// Outcome of reconciling the store with the exchange.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub status: SyncStatus,
    pub orders_found: usize,
    pub orders_cancelled: usize,
    pub cancel_failures: usize,
    pub positions_removed: u64,
    pub message: Option<String>,
}

/// Outcome of a graceful stop.
#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub closed: usize,
    /// Symbols still open on the exchange after every close round
    pub unresolved: Vec<String>,
    pub rounds: u32,
}

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    orders_submitted: AtomicU64,
    exchange_errors: AtomicU64,
    last_tick_ms: AtomicU64,
}

/// Main bot runner.
pub struct Bot {
    config: BotConfig,
    db: Database,
    client: ResilientClient,
    oracle: Arc<dyn SignalOracle>,
    risk: RiskEngine,
    tuner: Mutex<AdaptiveTuner>,
    notifications: Notifications,

    // Runtime state
    positions: Mutex<Vec<Position>>,
    /// Filled closes whose trade is not yet recorded, by position id
    pending_closes: Mutex<HashMap<String, Trade>>,
    balance_cache: Mutex<Option<(Decimal, Instant)>>,
    lifecycle: RwLock<Lifecycle>,
    last_error: RwLock<Option<String>>,
    unresolved: RwLock<Vec<String>>,
    counters: Counters,

    // Shutdown signal
    running: AtomicBool,
    wake: Notify,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Bot {
    pub fn new(
        config: BotConfig,
        db: Database,
        exchange: Arc<dyn Exchange>,
        oracle: Arc<dyn SignalOracle>,
        notifications: Notifications,
    ) -> Self {
        let client = ResilientClient::new(exchange, config.retry.clone(), notifications.clone());
        let risk = RiskEngine::new(config.risk.clone());
        let tuner = AdaptiveTuner::new(config.tuner.clone());

        Self {
            config,
            db,
            client,
            oracle,
            risk,
            tuner: Mutex::new(tuner),
            notifications,
            positions: Mutex::new(Vec::new()),
            pending_closes: Mutex::new(HashMap::new()),
            balance_cache: Mutex::new(None),
            lifecycle: RwLock::new(Lifecycle::Stopped),
            last_error: RwLock::new(None),
            unresolved: RwLock::new(Vec::new()),
            counters: Counters::default(),
            running: AtomicBool::new(false),
            wake: Notify::new(),
            loop_handle: Mutex::new(None),
        }
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().await
    }

    // ==================== Lifecycle ====================

    /// Reconcile with the exchange, restore the tuner and spawn the loop.
    pub async fn start(self: &Arc<Self>) -> Result<SyncReport, BotError> {
        {
            let mut lifecycle = self.lifecycle.write().await;
            if *lifecycle != Lifecycle::Stopped {
                return Err(BotError::AlreadyRunning);
            }
            *lifecycle = Lifecycle::Starting;
        }

        info!(
            testnet = self.config.testnet,
            dry_run = self.config.dry_run,
            symbols = self.config.symbols.len(),
            interval_secs = self.config.loop_interval_secs,
            "Starting bot"
        );

        let prepared = self.prepare().await;
        let report = match prepared {
            Ok(report) => report,
            Err(e) => {
                *self.lifecycle.write().await = Lifecycle::Stopped;
                return Err(e);
            }
        };

        *self.last_error.write().await = None;
        self.unresolved.write().await.clear();
        self.running.store(true, Ordering::SeqCst);
        *self.lifecycle.write().await = Lifecycle::Running;

        let bot = Arc::clone(self);
        let handle = tokio::spawn(async move { bot.run_loop().await });
        *self.loop_handle.lock().await = Some(handle);

        self.notifications.bot_started(self.config.testnet, self.config.dry_run);
        Ok(report)
    }

    async fn prepare(&self) -> Result<SyncReport, BotError> {
        let report = self.sync_account().await?;
        if report.status != SyncStatus::Clean {
            warn!(status = ?report.status, message = ?report.message, "Account sync was not clean");
        }

        let snapshot = self.db.latest_tuner_snapshot().await?;
        let mut history = self.db.recent_trades(self.config.tuner.window as i64).await?;
        history.reverse();
        self.tuner.lock().await.restore(snapshot, &history);

        Ok(report)
    }

    /// Stop the loop and flatten every open position.
    pub async fn stop(&self) -> Result<StopReport, BotError> {
        {
            let mut lifecycle = self.lifecycle.write().await;
            if *lifecycle != Lifecycle::Running {
                return Err(BotError::NotRunning);
            }
            *lifecycle = Lifecycle::Stopping;
        }

        info!("Stopping bot");
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();

        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Control loop task failed");
            }
        }

        self.client.set_draining(true);
        let report = self.close_all().await;
        self.client.set_draining(false);
        *self.unresolved.write().await = report.unresolved.clone();
        if !report.unresolved.is_empty() {
            error!(unresolved = ?report.unresolved, "Positions left open on the exchange");
        }
        self.notifications.bot_stopped(report.closed, &report.unresolved).await;

        *self.lifecycle.write().await = Lifecycle::Stopped;
        info!(closed = report.closed, unresolved = report.unresolved.len(), "Bot stopped");
        Ok(report)
    }

    async fn run_loop(self: Arc<Self>) {
        info!(interval_secs = self.config.loop_interval_secs, "Control loop started");

        while self.running.load(Ordering::SeqCst) {
            if let Some(remaining) = self.client.poll_breaker().await {
                let pause = remaining.min(self.config.loop_interval());
                info!(remaining_secs = remaining.as_secs(), "Circuit open, skipping tick");
                self.pause(pause).await;
                continue;
            }

            let started = Instant::now();
            match self.tick().await {
                Ok(()) => {}
                Err(BotError::PolicyHalt(reason)) => {
                    self.halt(reason).await;
                    break;
                }
                Err(e) => self.record_error(&e).await,
            }

            let elapsed = started.elapsed();
            self.counters
                .last_tick_ms
                .store(elapsed.as_millis() as u64, Ordering::Relaxed);
            if elapsed > self.config.retry.latency_threshold {
                warn!(elapsed_ms = elapsed.as_millis() as u64, "Slow tick");
            }

            self.pause(self.config.loop_interval()).await;
        }

        info!("Control loop exited");
    }

    /// Sleep, returning early when a stop is requested.
    async fn pause(&self, duration: Duration) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wake.notified() => {}
        }
    }

    async fn halt(&self, reason: String) {
        self.running.store(false, Ordering::SeqCst);
        let open: Vec<String> = self.positions.lock().await.iter().map(|p| p.symbol.clone()).collect();
        error!(reason = %reason, open = ?open, "Trading halted");
        *self.last_error.write().await = Some(reason.clone());
        *self.lifecycle.write().await = Lifecycle::Stopped;
        self.notifications.drawdown_halt(&reason, &open);
    }

    async fn record_error(&self, err: &BotError) {
        match err {
            BotError::Exchange(e) if e.is_critical() => {
                self.counters.exchange_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Tick failed");
                *self.last_error.write().await = Some(e.to_string());
            }
            BotError::Exchange(e) => {
                self.counters.exchange_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Tick interrupted by transient exchange error");
            }
            other => {
                error!(error = %other, "Tick failed");
                *self.last_error.write().await = Some(other.to_string());
            }
        }
    }

    // ==================== Tick ====================

    /// One pass of exit handling followed by entry admission.
    pub async fn tick(&self) -> Result<(), BotError> {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);

        self.flush_pending_closes().await;
        let positions = self.open_positions().await?;
        *self.positions.lock().await = positions.clone();

        let open = self.check_positions(positions).await?;
        if open < self.risk.params().max_positions as usize {
            self.try_open().await?;
        }

        Ok(())
    }

    /// Trail, then close what hit its exit. Returns how many stay open.
    async fn check_positions(&self, positions: Vec<Position>) -> Result<usize, BotError> {
        if positions.is_empty() {
            return Ok(0);
        }

        let symbols: Vec<String> = positions.iter().map(|p| p.symbol.clone()).collect();
        let prices = self.client.get_prices(&symbols).await?;
        let mut open = positions.len();

        for mut position in positions {
            let Some(price) = prices.get(&position.symbol).copied() else {
                warn!(symbol = %position.symbol, "No price for open position");
                continue;
            };
            let now = Utc::now();

            if risk::advance_trailing(&mut position, price, now) {
                debug!(
                    symbol = %position.symbol,
                    stop = %position.stop_loss,
                    activation = %position.trailing.activation_price,
                    "Trailing stop advanced"
                );
                self.db.update_trailing(&position).await?;
                self.cache_position(&position).await;
            }

            let reason = if self.risk.should_close_by_time(position.opened_at, now) {
                Some(CloseReason::TimeStop)
            } else {
                risk::should_close(
                    price,
                    position.entry_price,
                    position.stop_loss,
                    position.take_profit,
                    position.side,
                )
            };

            let Some(reason) = reason else { continue };
            info!(symbol = %position.symbol, %price, reason = %reason, "Exit triggered");

            match self.close_position(position, price, reason).await {
                Ok(_) => open -= 1,
                Err(e) => self.record_error(&e).await,
            }
        }

        Ok(open)
    }

    async fn cache_position(&self, position: &Position) {
        let mut cache = self.positions.lock().await;
        if let Some(slot) = cache.iter_mut().find(|p| p.id == position.id) {
            *slot = position.clone();
        }
    }

    /// Open positions from the store, minus closes still being recorded.
    async fn open_positions(&self) -> Result<Vec<Position>, BotError> {
        let mut positions = self.db.get_open_positions().await?;
        let pending = self.pending_closes.lock().await;
        positions.retain(|p| !pending.contains_key(&p.id));
        Ok(positions)
    }

    /// Flatten a position on the exchange and record the trade.
    ///
    /// Errors only when the closing order was not filled. Once it fills
    /// the order is never sent again, even if recording fails.
    async fn close_position(&self, position: Position, price: Decimal, reason: CloseReason) -> Result<Trade, BotError> {
        let order = OrderRequest::market(&position.symbol, position.side.opposite(), position.quantity);
        self.counters.orders_submitted.fetch_add(1, Ordering::Relaxed);
        let receipt = self.client.place_order(&order).await?;
        let exit_price = receipt.avg_price.unwrap_or(price);

        let trade = position.close(exit_price, reason, Utc::now());
        self.positions.lock().await.retain(|p| p.id != trade.id);
        self.invalidate_balance().await;
        self.record_close(&trade).await;

        let update = self.tuner.lock().await.on_trade_closed(&trade);
        if let Some(snapshot) = &update.snapshot {
            if let Err(e) = self.db.save_tuner_snapshot(snapshot).await {
                warn!(trade_id = %trade.id, error = %e, "Failed to save tuner snapshot");
            }
        }
        if update.rolled_back {
            warn!(trade_id = %trade.id, "Tuner rolled back to baseline parameters");
        }

        info!(
            symbol = %trade.symbol,
            side = %trade.side,
            exit = %trade.exit_price,
            pnl = %trade.pnl.round_dp(4),
            return_pct = %trade.return_pct.round_dp(2),
            reason = %trade.close_reason,
            "Position closed"
        );
        self.notifications.position_closed(&trade);
        Ok(trade)
    }

    /// Persist a filled close. On failure the trade is held back and the
    /// symbol reported unresolved until a later flush records it.
    async fn record_close(&self, trade: &Trade) {
        if let Err(e) = self.db.close_position_with_trade(trade).await {
            error!(
                symbol = %trade.symbol,
                trade_id = %trade.id,
                error = %e,
                "Position flattened but trade not recorded"
            );
            *self.last_error.write().await = Some(e.to_string());
            self.pending_closes.lock().await.insert(trade.id.clone(), trade.clone());
            let mut unresolved = self.unresolved.write().await;
            if !unresolved.contains(&trade.symbol) {
                unresolved.push(trade.symbol.clone());
            }
        }
    }

    /// Retry recording closes that filled but failed to persist.
    async fn flush_pending_closes(&self) {
        let pending: Vec<Trade> = self.pending_closes.lock().await.values().cloned().collect();
        for trade in pending {
            match self.db.close_position_with_trade(&trade).await {
                Ok(_) => {
                    self.pending_closes.lock().await.remove(&trade.id);
                    self.unresolved.write().await.retain(|s| s != &trade.symbol);
                    info!(symbol = %trade.symbol, trade_id = %trade.id, "Recorded pending close");
                }
                Err(e) => {
                    warn!(symbol = %trade.symbol, trade_id = %trade.id, error = %e, "Pending close still not recorded");
                }
            }
        }
    }

    // ==================== Entries ====================

    async fn try_open(&self) -> Result<(), BotError> {
        let now = Utc::now();
        let balance = self.balance().await?;
        self.check_drawdown(balance, now).await?;

        if self.config.is_blocked_hour(now.hour()) {
            debug!(hour = now.hour(), "Entries blocked this hour");
            return Ok(());
        }

        let held: Vec<String> = self.positions.lock().await.iter().map(|p| p.symbol.clone()).collect();
        if held.len() >= self.risk.params().max_positions as usize {
            return Ok(());
        }

        let universe: Vec<&String> = self
            .config
            .symbols
            .iter()
            .filter(|s| !self.config.is_blacklisted(s) && !held.contains(s))
            .collect();
        if universe.is_empty() {
            return Ok(());
        }

        let liquid = join_all(universe.iter().map(|s| self.liquid_enough(s))).await;
        let eligible: Vec<&String> = universe
            .into_iter()
            .zip(liquid)
            .filter_map(|(s, ok)| ok.then_some(s))
            .collect();

        let analyses = join_all(eligible.iter().map(|s| async move {
            let result = self.oracle.analyze(s).await;
            (*s, result)
        }))
        .await;

        let mut candidates: Vec<(&String, Side, Analysis)> = analyses
            .into_iter()
            .filter_map(|(symbol, result)| match result {
                Ok(analysis) => {
                    let side = match analysis.signal {
                        Signal::Buy => Side::Long,
                        Signal::Sell if self.config.allow_short => Side::Short,
                        _ => return None,
                    };
                    Some((symbol, side, analysis))
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Oracle query failed");
                    None
                }
            })
            .collect();
        candidates.sort_by(|a, b| b.2.strength.total_cmp(&a.2.strength));

        for (symbol, side, analysis) in candidates {
            let score = {
                let tuner = self.tuner.lock().await;
                let score = tuner.opportunity_score(symbol, analysis.strength);
                if !tuner.should_take_trade(symbol, score) {
                    debug!(symbol = %symbol, score, "Candidate rejected by tuner");
                    continue;
                }
                score
            };
            return self.open_position(symbol, side, &analysis, score, balance).await;
        }

        Ok(())
    }

    /// Halt once realized losses since the UTC day or week start breach
    /// their limit.
    async fn check_drawdown(&self, balance: Decimal, now: DateTime<Utc>) -> Result<(), BotError> {
        let day_start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        let week_start = day_start - ChronoDuration::days(now.weekday().num_days_from_monday() as i64);

        let windows = [
            ("daily", self.config.daily_drawdown_limit, day_start),
            ("weekly", self.config.weekly_drawdown_limit, week_start),
        ];
        for (label, limit, since) in windows {
            if limit <= Decimal::ZERO {
                continue;
            }
            let realized = self.db.pnl_since(since).await?;
            let floor = -(balance * limit / dec!(100));
            if realized < Decimal::ZERO && realized <= floor {
                return Err(BotError::PolicyHalt(format!(
                    "{} drawdown limit reached: realized {} vs limit {}% of balance {}",
                    label,
                    realized.round_dp(2),
                    limit,
                    balance.round_dp(2)
                )));
            }
        }
        Ok(())
    }

    async fn liquid_enough(&self, symbol: &str) -> bool {
        let liquidity = match self.client.liquidity(symbol).await {
            Ok(l) => l,
            Err(e) => {
                warn!(symbol, error = %e, "Liquidity check failed");
                return false;
            }
        };
        let spread_ok = liquidity
            .spread_pct()
            .map_or(false, |s| s <= self.config.max_spread_pct);
        let volume_ok = liquidity.quote_volume >= self.config.min_quote_volume;
        if !(spread_ok && volume_ok) {
            debug!(
                symbol,
                spread = ?liquidity.spread_pct(),
                volume = %liquidity.quote_volume,
                "Insufficient liquidity"
            );
        }
        spread_ok && volume_ok
    }

    /// Apply tuner multipliers to a base plan.
    ///
    /// A stop or target pushed across entry falls back to the base
    /// value. Notional never exceeds balance.
    async fn tune_plan(&self, plan: PositionPlan, entry: Decimal, side: Side, balance: Decimal) -> PositionPlan {
        let (stop, target, notional) = {
            let tuner = self.tuner.lock().await;
            (
                tuner.adjust_stop_loss(plan.stop_loss, entry),
                tuner.adjust_take_profit(plan.take_profit, entry),
                tuner.adjust_position_size(plan.notional).min(balance),
            )
        };

        let (stop_ok, target_ok) = match side {
            Side::Long => (stop > Decimal::ZERO && stop < entry, target > entry),
            Side::Short => (stop > entry, target > Decimal::ZERO && target < entry),
        };
        let stop = if stop_ok { stop } else { plan.stop_loss };
        let target = if target_ok { target } else { plan.take_profit };

        let stop_loss_pct = self.risk.params().stop_loss_pct;
        plan.with_levels(entry, stop, target)
            .with_notional(notional, entry, stop_loss_pct)
    }

    async fn open_position(
        &self,
        symbol: &str,
        side: Side,
        analysis: &Analysis,
        score: f64,
        balance: Decimal,
    ) -> Result<(), BotError> {
        let price = self.client.get_price(symbol).await?;
        let plan = self
            .risk
            .size_position(balance, price, side, analysis.atr, analysis.volatility_regime);
        if plan.is_empty() {
            warn!(symbol, %balance, %price, "Sizing produced an empty plan");
            return Ok(());
        }
        let plan = self.tune_plan(plan, price, side, balance).await;
        if plan.is_empty() {
            return Ok(());
        }

        if self.db.has_open_position(symbol).await? {
            debug!(symbol, "Position already open, skipping entry");
            return Ok(());
        }

        let order = OrderRequest::market(symbol, side, plan.quantity);
        self.counters.orders_submitted.fetch_add(1, Ordering::Relaxed);
        let receipt = self.client.place_order(&order).await?;
        self.invalidate_balance().await;

        let entry = receipt.avg_price.unwrap_or(price);
        let quantity = if receipt.executed_qty > Decimal::ZERO {
            receipt.executed_qty
        } else {
            plan.quantity
        };
        let position = Position {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            entry_price: entry,
            quantity,
            notional: entry * quantity,
            // Keep the planned distances when the fill slips
            stop_loss: entry + (plan.stop_loss - price),
            take_profit: entry + (plan.take_profit - price),
            risk_amount: plan.risk_amount,
            confidence: score,
            trailing: self.risk.trailing_for(entry, side),
            opened_at: Utc::now(),
            status: PositionStatus::Open,
        };

        if let Err(e) = position.validate() {
            warn!(symbol, error = %e, "Filled position failed validation, unwinding");
            self.unwind(&position).await;
            return Ok(());
        }

        if !self.db.insert_position_if_absent(&position).await? {
            warn!(symbol, "Another entry on this symbol won the race, unwinding");
            self.unwind(&position).await;
            return Ok(());
        }

        self.positions.lock().await.push(position.clone());
        info!(
            symbol,
            side = %side,
            entry = %position.entry_price,
            quantity = %position.quantity,
            stop = %position.stop_loss,
            target = %position.take_profit,
            score,
            "Position opened"
        );
        self.notifications.position_opened(&position);
        Ok(())
    }

    /// Reverse a fill that could not be recorded.
    async fn unwind(&self, position: &Position) {
        let order = OrderRequest::market(&position.symbol, position.side.opposite(), position.quantity);
        self.counters.orders_submitted.fetch_add(1, Ordering::Relaxed);
        match self.client.place_order(&order).await {
            Ok(_) => {
                self.invalidate_balance().await;
                info!(symbol = %position.symbol, quantity = %position.quantity, "Entry unwound");
            }
            Err(e) => {
                self.counters.exchange_errors.fetch_add(1, Ordering::Relaxed);
                error!(symbol = %position.symbol, error = %e, "Failed to unwind entry");
                *self.last_error.write().await = Some(e.to_string());
                self.unresolved.write().await.push(position.symbol.clone());
            }
        }
    }

    // ==================== Balance ====================

    /// Free quote balance, refreshed at most once per cache TTL.
    async fn balance(&self) -> Result<Decimal, BotError> {
        let mut cache = self.balance_cache.lock().await;
        if let Some((value, at)) = *cache {
            if at.elapsed() < self.config.balance_cache_ttl() {
                return Ok(value);
            }
        }
        let value = self.client.balance(&self.config.quote_asset).await?;
        *cache = Some((value, Instant::now()));
        Ok(value)
    }

    async fn invalidate_balance(&self) {
        *self.balance_cache.lock().await = None;
    }

    // ==================== Shutdown ====================

    /// Close every open position, retrying failed closes in rounds.
    async fn close_all(&self) -> StopReport {
        self.flush_pending_closes().await;
        let mut queue = match self.open_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(error = %e, "Failed to load positions for shutdown, using cache");
                self.positions.lock().await.clone()
            }
        };

        let rounds = self.config.shutdown_close_rounds.max(1);
        let delay = Duration::from_secs(self.config.shutdown_retry_delay_secs);
        let mut closed = 0;
        let mut used = 0;

        for round in 1..=rounds {
            if queue.is_empty() {
                break;
            }
            used = round;
            info!(round, remaining = queue.len(), "Closing positions for shutdown");

            let symbols: Vec<String> = queue.iter().map(|p| p.symbol.clone()).collect();
            let prices = match self.client.get_prices(&symbols).await {
                Ok(prices) => prices,
                Err(e) => {
                    warn!(error = %e, "Price fetch failed during shutdown");
                    Default::default()
                }
            };

            let mut failed = Vec::new();
            for position in queue {
                let price = prices.get(&position.symbol).copied().unwrap_or(position.entry_price);
                match self.close_position(position.clone(), price, CloseReason::Shutdown).await {
                    Ok(_) => closed += 1,
                    Err(e) => {
                        warn!(round, symbol = %position.symbol, error = %e, "Shutdown close failed");
                        failed.push(position);
                    }
                }
            }
            queue = failed;

            if !queue.is_empty() && round < rounds {
                tokio::time::sleep(delay).await;
            }
        }

        self.flush_pending_closes().await;
        let mut unresolved: Vec<String> = queue.into_iter().map(|p| p.symbol).collect();
        for trade in self.pending_closes.lock().await.values() {
            if !unresolved.contains(&trade.symbol) {
                unresolved.push(trade.symbol.clone());
            }
        }

        StopReport {
            closed,
            unresolved,
            rounds: used,
        }
    }

    // ==================== Account sync ====================

    /// Cancel resting orders and drop stale open positions from the store.
    pub async fn sync_account(&self) -> Result<SyncReport, BotError> {
        if matches!(self.lifecycle().await, Lifecycle::Running | Lifecycle::Stopping) {
            return Err(BotError::AlreadyRunning);
        }

        let orders = match self.client.open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                let status = if e.is_critical() { SyncStatus::Error } else { SyncStatus::Retry };
                warn!(status = ?status, error = %e, "Account sync could not list open orders");
                return Ok(SyncReport {
                    status,
                    orders_found: 0,
                    orders_cancelled: 0,
                    cancel_failures: 0,
                    positions_removed: 0,
                    message: Some(e.to_string()),
                });
            }
        };

        let mut cancelled = 0;
        let mut failures = 0;
        for order in &orders {
            match self.client.cancel_order(&order.symbol, &order.order_id).await {
                Ok(()) => {
                    cancelled += 1;
                    info!(symbol = %order.symbol, order_id = %order.order_id, "Cancelled open order");
                }
                Err(e) => {
                    failures += 1;
                    warn!(symbol = %order.symbol, order_id = %order.order_id, error = %e, "Cancel failed");
                }
            }
        }

        let stale: Vec<String> = self
            .db
            .get_open_positions()
            .await?
            .into_iter()
            .map(|p| p.symbol)
            .collect();
        let removed = self.db.delete_open_positions().await?;
        if removed > 0 {
            warn!(symbols = ?stale, "Dropped stale open positions from the store");
        }
        self.positions.lock().await.clear();

        let status = if failures > 0 {
            SyncStatus::Retry
        } else if cancelled > 0 || removed > 0 {
            SyncStatus::Cleaned
        } else {
            SyncStatus::Clean
        };
        info!(status = ?status, orders = orders.len(), cancelled, removed, "Account synced");

        Ok(SyncReport {
            status,
            orders_found: orders.len(),
            orders_cancelled: cancelled,
            cancel_failures: failures,
            positions_removed: removed,
            message: None,
        })
    }

    // ==================== Status ====================

    pub async fn get_status(&self) -> BotStatus {
        let (tuned, tuner_mode) = {
            let tuner = self.tuner.lock().await;
            (tuner.params(), tuner.mode())
        };

        BotStatus {
            lifecycle: self.lifecycle().await,
            testnet: self.config.testnet,
            dry_run: self.config.dry_run,
            balance: self.balance_cache.lock().await.map(|(value, _)| value),
            open_positions: self.positions.lock().await.clone(),
            max_positions: self.risk.params().max_positions,
            circuit: self.client.breaker_status().await,
            clock_offset_ms: self.client.clock_offset_ms(),
            tuned,
            tuner_mode,
            last_error: self.last_error.read().await.clone(),
            unresolved: self.unresolved.read().await.clone(),
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            orders_submitted: self.counters.orders_submitted.load(Ordering::Relaxed),
            exchange_errors: self.counters.exchange_errors.load(Ordering::Relaxed),
            last_tick_ms: self.counters.last_tick_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time bot status.
#[derive(Debug, Clone, Serialize)]
pub struct BotStatus {
    pub lifecycle: Lifecycle,
    pub testnet: bool,
    pub dry_run: bool,
    /// Last cached quote balance
    pub balance: Option<Decimal>,
    pub open_positions: Vec<Position>,
    pub max_positions: u32,
    pub circuit: CircuitStatus,
    /// Server minus local clock, from the last sync
    pub clock_offset_ms: i64,
    pub tuned: TunedParameters,
    pub tuner_mode: TunerMode,
    pub last_error: Option<String>,
    pub unresolved: Vec<String>,
    pub ticks: u64,
    pub orders_submitted: u64,
    pub exchange_errors: u64,
    pub last_tick_ms: u64,
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Bot Status ===")?;
        writeln!(f, "State:           {} {}{}",
            self.lifecycle,
            if self.testnet { "(Testnet)" } else { "(Mainnet)" },
            if self.dry_run { " (Dry Run)" } else { "" })?;
        match self.balance {
            Some(balance) => writeln!(f, "Balance:         {:.2}", balance)?,
            None => writeln!(f, "Balance:         unknown")?,
        }
        writeln!(f, "Open Positions:  {}/{}", self.open_positions.len(), self.max_positions)?;
        for p in &self.open_positions {
            writeln!(f, "  {} {} qty {} @ {} (SL {} / TP {})",
                p.side, p.symbol, p.quantity.round_dp(8), p.entry_price.round_dp(8),
                p.stop_loss.round_dp(8), p.take_profit.round_dp(8))?;
        }
        writeln!(f, "Circuit:         {} ({} consecutive failures)",
            if self.circuit.open { "OPEN" } else { "closed" },
            self.circuit.consecutive_failures)?;
        writeln!(f, "Clock Offset:    {} ms", self.clock_offset_ms)?;
        writeln!(f, "Tuner ({}):  conf {:.3}, SL x{:.3}, TP x{:.3}, size x{:.3}",
            self.tuner_mode,
            self.tuned.min_confidence,
            self.tuned.stop_loss_multiplier,
            self.tuned.take_profit_multiplier,
            self.tuned.position_size_multiplier)?;
        writeln!(f, "Ticks:           {} (last {} ms)", self.ticks, self.last_tick_ms)?;
        writeln!(f, "Orders:          {} (exchange errors: {})", self.orders_submitted, self.exchange_errors)?;
        if let Some(err) = &self.last_error {
            writeln!(f, "Last Error:      {}", err)?;
        }
        if !self.unresolved.is_empty() {
            writeln!(f, "UNRESOLVED:      {}", self.unresolved.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use anyhow::Result;
    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    use crate::error::ExchangeError;
    use crate::exchange::{Liquidity, OpenOrder, OrderReceipt, PaperExchange, RetryPolicy};
    use crate::models::TrailingStop;
    use crate::notify::Notifier;
    use crate::risk::VolatilityRegime;

    /// Paper exchange with switchable faults.
    struct TestExchange {
        paper: PaperExchange,
        reject_sells: AtomicBool,
        fail_prices: AtomicBool,
        resting: Vec<OpenOrder>,
        orders_error: Option<ExchangeError>,
        cancel_fails: bool,
    }

    impl TestExchange {
        async fn new(price: Decimal) -> Self {
            let paper = PaperExchange::new("USDT", dec!(1000));
            paper.set_price("BTCUSDT", price).await;
            Self {
                paper,
                reject_sells: AtomicBool::new(false),
                fail_prices: AtomicBool::new(false),
                resting: Vec::new(),
                orders_error: None,
                cancel_fails: false,
            }
        }
    }

    #[async_trait]
    impl Exchange for TestExchange {
        async fn place_order(&self, order: &OrderRequest) -> Result<OrderReceipt, ExchangeError> {
            if order.side == Side::Short && self.reject_sells.load(Ordering::SeqCst) {
                return Err(ExchangeError::OrderRejected("market closed".to_string()));
            }
            self.paper.place_order(order).await
        }

        async fn get_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
            if self.fail_prices.load(Ordering::SeqCst) {
                return Err(ExchangeError::Connectivity("feed down".to_string()));
            }
            self.paper.get_price(symbol).await
        }

        async fn get_prices(&self, symbols: &[String]) -> Result<HashMap<String, Decimal>, ExchangeError> {
            if self.fail_prices.load(Ordering::SeqCst) {
                return Err(ExchangeError::Connectivity("feed down".to_string()));
            }
            self.paper.get_prices(symbols).await
        }

        async fn open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
            if let Some(e) = &self.orders_error {
                return Err(e.clone());
            }
            Ok(self.resting.clone())
        }

        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<(), ExchangeError> {
            if self.cancel_fails {
                return Err(ExchangeError::Other("unknown order".to_string()));
            }
            Ok(())
        }

        async fn balance(&self, asset: &str) -> Result<Decimal, ExchangeError> {
            self.paper.balance(asset).await
        }

        async fn liquidity(&self, symbol: &str) -> Result<Liquidity, ExchangeError> {
            self.paper.liquidity(symbol).await
        }

        async fn server_time(&self) -> Result<i64, ExchangeError> {
            self.paper.server_time().await
        }

        fn set_time_offset(&self, _offset_ms: i64) {}
    }

    struct StubOracle;

    #[async_trait]
    impl SignalOracle for StubOracle {
        async fn analyze(&self, _symbol: &str) -> Result<Analysis> {
            Ok(Analysis {
                signal: Signal::Buy,
                strength: 80.0,
                suggested_stop: None,
                suggested_target: None,
                atr: None,
                volatility_regime: VolatilityRegime::Normal,
            })
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        messages: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, message: &str) -> Result<()> {
            self.messages.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn test_config() -> BotConfig {
        let mut config = BotConfig::default();
        config.symbols = vec!["BTCUSDT".to_string()];
        config.blocked_hours = Vec::new();
        config.loop_interval_secs = 5;
        config.shutdown_retry_delay_secs = 0;
        config.retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            time_sync_interval: Duration::from_secs(3600),
            ..RetryPolicy::default()
        };
        config
    }

    async fn make_bot(config: BotConfig, exchange: Arc<TestExchange>) -> (Arc<Bot>, RecordingNotifier) {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let notifier = RecordingNotifier::default();
        let bot = Bot::new(
            config,
            db,
            exchange,
            Arc::new(StubOracle),
            Notifications::new(Arc::new(notifier.clone())),
        );
        (Arc::new(bot), notifier)
    }

    fn held_position(symbol: &str, opened_at: DateTime<Utc>) -> Position {
        Position {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: Side::Long,
            entry_price: dec!(100),
            quantity: Decimal::ONE,
            notional: dec!(100),
            stop_loss: dec!(90),
            take_profit: dec!(120),
            risk_amount: dec!(10),
            confidence: 0.6,
            trailing: TrailingStop {
                activation_price: dec!(101),
                step_pct: dec!(0.5),
                armed: false,
                factor: None,
                updated_at: None,
            },
            opened_at,
            status: PositionStatus::Open,
        }
    }

    fn losing_trade(pnl_each: Decimal) -> Trade {
        held_position("ETHUSDT", Utc::now()).close(dec!(100) + pnl_each, CloseReason::StopLoss, Utc::now())
    }

    async fn wait_for<F>(bot: &Bot, mut done: F)
    where
        F: FnMut(&BotStatus) -> bool,
    {
        for _ in 0..200 {
            if done(&bot.get_status().await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_tick_opens_sized_position() {
        let exchange = Arc::new(TestExchange::new(dec!(100)).await);
        let (bot, _) = make_bot(test_config(), exchange.clone()).await;

        assert_ok!(bot.tick().await);

        let open = bot.db.get_open_positions().await.unwrap();
        assert_eq!(open.len(), 1);
        let position = &open[0];
        assert_eq!(position.side, Side::Long);
        assert_eq!(position.stop_loss, dec!(98.5));
        assert_eq!(position.take_profit, dec!(103));
        // min(20 / 1.5%, 1000, 1000 / 3)
        assert_eq!(position.notional.round_dp(2), dec!(333.33));
        assert!((position.confidence - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_racing_ticks_persist_one_position() {
        let exchange = Arc::new(TestExchange::new(dec!(100)).await);
        let (bot, _) = make_bot(test_config(), exchange.clone()).await;

        let (a, b) = tokio::join!(bot.tick(), bot.tick());
        assert_ok!(a);
        assert_ok!(b);

        assert_eq!(bot.db.get_open_positions().await.unwrap().len(), 1);
        assert_eq!(bot.get_status().await.open_positions.len(), 1);

        // Any losing entry was unwound, so net exposure is a single fill
        let fills = exchange.paper.fills().await;
        let net: Decimal = fills
            .iter()
            .map(|f| match f.side {
                Side::Long => f.executed_qty,
                Side::Short => -f.executed_qty,
            })
            .sum();
        let held = bot.db.get_open_positions().await.unwrap()[0].quantity;
        assert_eq!(net, held);
    }

    #[tokio::test]
    async fn test_take_profit_closes_and_records_trade() {
        let exchange = Arc::new(TestExchange::new(dec!(100)).await);
        let (bot, _) = make_bot(test_config(), exchange.clone()).await;
        bot.tick().await.unwrap();

        exchange.paper.set_price("BTCUSDT", dec!(104)).await;
        assert_ok!(bot.tick().await);

        let trades = bot.db.recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].close_reason, CloseReason::TakeProfit);
        assert_eq!(trades[0].exit_price, dec!(104));
        assert!(trades[0].pnl > Decimal::ZERO);

        // The freed slot is refilled at the new price
        let open = bot.db.get_open_positions().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].entry_price, dec!(104));
    }

    #[tokio::test]
    async fn test_trailing_stop_is_persisted() {
        let exchange = Arc::new(TestExchange::new(dec!(100)).await);
        let (bot, _) = make_bot(test_config(), exchange.clone()).await;
        bot.tick().await.unwrap();

        exchange.paper.set_price("BTCUSDT", dec!(101)).await;
        assert_ok!(bot.tick().await);

        let position = bot.db.get_open_positions().await.unwrap().remove(0);
        assert!(position.trailing.armed);
        assert!(position.stop_loss > dec!(98.5));
        assert!(position.stop_loss < dec!(101));
    }

    #[tokio::test]
    async fn test_daily_drawdown_halts_entries() {
        let exchange = Arc::new(TestExchange::new(dec!(100)).await);
        let mut config = test_config();
        config.daily_drawdown_limit = dec!(2);
        let (bot, _) = make_bot(config, exchange).await;

        // -30 realized today against a 20 limit (2% of 1000)
        bot.db.close_position_with_trade(&losing_trade(dec!(-30))).await.unwrap();

        let err = assert_err!(bot.tick().await);
        assert!(matches!(err, BotError::PolicyHalt(ref reason) if reason.contains("daily")));
        assert!(bot.db.get_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drawdown_halt_stops_loop() {
        let exchange = Arc::new(TestExchange::new(dec!(100)).await);
        let mut config = test_config();
        config.weekly_drawdown_limit = dec!(1);
        let (bot, _) = make_bot(config, exchange).await;
        bot.db.close_position_with_trade(&losing_trade(dec!(-15))).await.unwrap();

        assert_ok!(bot.start().await);
        wait_for(&bot, |s| s.lifecycle == Lifecycle::Stopped).await;

        let status = bot.get_status().await;
        assert!(status.last_error.unwrap().contains("weekly"));
        assert!(matches!(bot.stop().await, Err(BotError::NotRunning)));
    }

    #[tokio::test]
    async fn test_small_loss_does_not_halt() {
        let exchange = Arc::new(TestExchange::new(dec!(100)).await);
        let mut config = test_config();
        config.daily_drawdown_limit = dec!(2);
        let (bot, _) = make_bot(config, exchange).await;
        bot.db.close_position_with_trade(&losing_trade(dec!(-5))).await.unwrap();

        assert_ok!(bot.tick().await);
        assert_eq!(bot.db.get_open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_reports_unresolved_exposure() {
        let exchange = Arc::new(TestExchange::new(dec!(100)).await);
        let (bot, notifier) = make_bot(test_config(), exchange.clone()).await;

        assert_ok!(bot.start().await);
        wait_for(&bot, |s| s.open_positions.len() == 1).await;

        exchange.reject_sells.store(true, Ordering::SeqCst);
        let report = assert_ok!(bot.stop().await);

        assert_eq!(report.closed, 0);
        assert_eq!(report.unresolved, vec!["BTCUSDT".to_string()]);
        assert_eq!(report.rounds, 3);

        let status = bot.get_status().await;
        assert_eq!(status.lifecycle, Lifecycle::Stopped);
        assert_eq!(status.unresolved, vec!["BTCUSDT".to_string()]);

        let messages = notifier.messages.lock().unwrap().clone();
        assert!(messages.iter().any(|m| m.contains("UNRESOLVED") && m.contains("BTCUSDT")));
    }

    #[tokio::test]
    async fn test_stop_closes_positions() {
        let exchange = Arc::new(TestExchange::new(dec!(100)).await);
        let (bot, _) = make_bot(test_config(), exchange.clone()).await;

        assert_ok!(bot.start().await);
        assert!(matches!(bot.start().await, Err(BotError::AlreadyRunning)));
        wait_for(&bot, |s| s.open_positions.len() == 1).await;

        let report = assert_ok!(bot.stop().await);
        assert_eq!(report.closed, 1);
        assert!(report.unresolved.is_empty());

        let trades = bot.db.recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].close_reason, CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn test_sync_account_cleans_stale_state() {
        let exchange = Arc::new(TestExchange::new(dec!(100)).await);
        let (bot, _) = make_bot(test_config(), exchange).await;

        let report = assert_ok!(bot.sync_account().await);
        assert_eq!(report.status, SyncStatus::Clean);

        bot.tick().await.unwrap();
        let report = assert_ok!(bot.sync_account().await);
        assert_eq!(report.status, SyncStatus::Cleaned);
        assert_eq!(report.positions_removed, 1);
        assert!(bot.db.get_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_account_retries_failed_cancels() {
        let mut exchange = TestExchange::new(dec!(100)).await;
        exchange.resting = vec![OpenOrder {
            order_id: "42".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            quantity: dec!(1),
            price: dec!(95),
        }];
        exchange.cancel_fails = true;
        let (bot, _) = make_bot(test_config(), Arc::new(exchange)).await;

        let report = assert_ok!(bot.sync_account().await);
        assert_eq!(report.status, SyncStatus::Retry);
        assert_eq!(report.orders_found, 1);
        assert_eq!(report.cancel_failures, 1);
    }

    #[tokio::test]
    async fn test_trailed_stop_past_entry_still_exits() {
        let exchange = Arc::new(TestExchange::new(dec!(100)).await);
        let (bot, _) = make_bot(test_config(), exchange.clone()).await;
        bot.tick().await.unwrap();

        // 1% up: the trail locks in profit above entry
        exchange.paper.set_price("BTCUSDT", dec!(101)).await;
        assert_ok!(bot.tick().await);
        let position = bot.db.get_open_positions().await.unwrap().remove(0);
        assert_eq!(position.stop_loss, dec!(100.6465));
        assert!(position.stop_loss > position.entry_price);

        exchange.paper.set_price("BTCUSDT", dec!(100.5)).await;
        assert_ok!(bot.tick().await);

        let trades = bot.db.recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].close_reason, CloseReason::StopLoss);
        assert_eq!(trades[0].exit_price, dec!(100.5));
        assert!(trades[0].pnl > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_unrecorded_close_is_not_sold_again() {
        let exchange = Arc::new(TestExchange::new(dec!(100)).await);
        let (bot, _) = make_bot(test_config(), exchange.clone()).await;
        bot.tick().await.unwrap();

        sqlx::query("CREATE TRIGGER reject_trades BEFORE INSERT ON trades BEGIN SELECT RAISE(ABORT, 'disk full'); END")
            .execute(bot.db.pool())
            .await
            .unwrap();

        exchange.paper.set_price("BTCUSDT", dec!(104)).await;
        assert_ok!(bot.tick().await);
        assert_eq!(exchange.paper.fills().await.len(), 2);
        assert_eq!(bot.get_status().await.unresolved, vec!["BTCUSDT".to_string()]);

        // Still failing: no second sell and no new entry on the symbol
        assert_ok!(bot.tick().await);
        assert_eq!(exchange.paper.fills().await.len(), 2);
        assert!(bot.db.recent_trades(10).await.unwrap().is_empty());

        sqlx::query("DROP TRIGGER reject_trades")
            .execute(bot.db.pool())
            .await
            .unwrap();
        assert_ok!(bot.tick().await);

        let trades = bot.db.recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].close_reason, CloseReason::TakeProfit);
        assert_eq!(trades[0].exit_price, dec!(104));
        assert!(bot.get_status().await.unresolved.is_empty());

        // The symbol is free again and gets a fresh entry
        let fills = exchange.paper.fills().await;
        assert_eq!(fills.len(), 3);
        assert_eq!(fills[2].side, Side::Long);
    }

    #[tokio::test]
    async fn test_time_stop_closes_stale_position() {
        let exchange = Arc::new(TestExchange::new(dec!(100)).await);
        let mut config = test_config();
        config.risk.max_hold_hours = 2;
        let (bot, _) = make_bot(config, exchange.clone()).await;

        let stale = held_position("BTCUSDT", Utc::now() - ChronoDuration::hours(3));
        assert!(bot.db.insert_position_if_absent(&stale).await.unwrap());

        assert_ok!(bot.tick().await);

        let trades = bot.db.recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].id, stale.id);
        assert_eq!(trades[0].close_reason, CloseReason::TimeStop);
        assert_eq!(trades[0].pnl, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_loop_waits_out_open_breaker() {
        let exchange = Arc::new(TestExchange::new(dec!(100)).await);
        exchange.fail_prices.store(true, Ordering::SeqCst);
        let mut config = test_config();
        config.loop_interval_secs = 1;
        config.retry.breaker_threshold = 1;
        config.retry.breaker_cooldown = Duration::from_millis(1500);
        let (bot, notifier) = make_bot(config, exchange.clone()).await;

        assert_ok!(bot.start().await);
        wait_for(&bot, |s| s.circuit.open).await;
        let ticks = bot.get_status().await.ticks;
        exchange.fail_prices.store(false, Ordering::SeqCst);

        // Past the next interval but inside the cooldown
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(bot.get_status().await.ticks, ticks);
        assert!(bot.db.get_open_positions().await.unwrap().is_empty());

        wait_for(&bot, |s| s.open_positions.len() == 1).await;
        let status = bot.get_status().await;
        assert!(!status.circuit.open);
        assert!(status.ticks > ticks);

        assert_ok!(bot.stop().await);
        let messages = notifier.messages.lock().unwrap().clone();
        assert!(messages.iter().any(|m| m.contains("Circuit breaker OPEN")));
        assert!(messages.iter().any(|m| m.contains("Circuit breaker closed")));
    }

    #[tokio::test]
    async fn test_sync_account_status_follows_failure_class() {
        let mut exchange = TestExchange::new(dec!(100)).await;
        exchange.orders_error = Some(ExchangeError::Connectivity("timeout".to_string()));
        let (bot, _) = make_bot(test_config(), Arc::new(exchange)).await;
        let report = assert_ok!(bot.sync_account().await);
        assert_eq!(report.status, SyncStatus::Retry);

        let mut exchange = TestExchange::new(dec!(100)).await;
        exchange.orders_error = Some(ExchangeError::Auth("invalid key".to_string()));
        let (bot, _) = make_bot(test_config(), Arc::new(exchange)).await;
        let report = assert_ok!(bot.sync_account().await);
        assert_eq!(report.status, SyncStatus::Error);
        assert!(report.message.unwrap().contains("invalid key"));
    }
}
