//! Retry, classification and circuit accounting around exchange calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use super::{CircuitBreaker, CircuitEvent, CircuitStatus, Exchange, Liquidity, OpenOrder, OrderReceipt, OrderRequest};
use crate::error::{ExchangeError, FailureClass, ServiceError};
use crate::notify::Notifications;

/// Retry and breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per call, including the first
    pub max_attempts: u32,

    /// Backoff unit; attempt n waits n times this
    #[serde(with = "millis")]
    pub base_delay: Duration,

    /// Successful calls slower than this count as failures
    #[serde(with = "millis")]
    pub latency_threshold: Duration,

    /// Minimum spacing between clock resyncs
    #[serde(with = "millis")]
    pub time_sync_interval: Duration,

    /// Concurrent exchange calls in flight
    pub max_in_flight: usize,

    /// Consecutive failures that open the breaker
    pub breaker_threshold: u32,

    #[serde(with = "millis")]
    pub breaker_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            latency_threshold: Duration::from_secs(2),
            time_sync_interval: Duration::from_secs(30),
            max_in_flight: 4,
            breaker_threshold: 10,
            breaker_cooldown: Duration::from_secs(120),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Linear backoff: waits `base * attempt` and gives up after `max_attempts` calls.
#[derive(Debug, Clone)]
struct LinearBackoff {
    base: Duration,
    attempt: u32,
    max_attempts: u32,
}

impl LinearBackoff {
    fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            attempt: 0,
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.max_attempts {
            None
        } else {
            Some(self.base * self.attempt)
        }
    }
}

/// Every exchange call goes through here.
pub struct ResilientClient {
    exchange: Arc<dyn Exchange>,
    policy: RetryPolicy,
    breaker: Mutex<CircuitBreaker>,
    permits: Semaphore,
    last_sync: Mutex<Option<Instant>>,
    offset_ms: AtomicI64,
    /// Shutdown closes go out even while the breaker is open
    draining: AtomicBool,
    notifications: Notifications,
}

impl ResilientClient {
    pub fn new(exchange: Arc<dyn Exchange>, policy: RetryPolicy, notifications: Notifications) -> Self {
        let breaker = CircuitBreaker::new(policy.breaker_threshold, policy.breaker_cooldown);
        let permits = Semaphore::new(policy.max_in_flight.max(1));
        Self {
            exchange,
            policy,
            breaker: Mutex::new(breaker),
            permits,
            last_sync: Mutex::new(None),
            offset_ms: AtomicI64::new(0),
            draining: AtomicBool::new(false),
            notifications,
        }
    }

    /// Let calls through an open breaker until switched off again.
    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::SeqCst);
    }

    /// Run `operation` with retries.
    ///
    /// Critical failures are returned at once. Transient and unclassified
    /// failures are retried; once attempts run out they come back as
    /// critical if `critical` is set, otherwise as transient. While the
    /// breaker is open nothing is sent unless the client is draining.
    pub async fn execute<T, F, Fut>(&self, action: &str, critical: bool, operation: F) -> Result<T, ServiceError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        if !self.draining.load(Ordering::SeqCst) && self.breaker.lock().await.is_open(Instant::now()) {
            debug!(action, "Circuit open, call not sent");
            return Err(ServiceError::CircuitOpen {
                action: action.to_string(),
            });
        }

        self.sync_clock(false).await;

        let this = self;
        let operation = &operation;
        let attempts = AtomicU64::new(0);
        let attempts = &attempts;
        let last_latency_ms = AtomicU64::new(0);
        let last_latency_ms = &last_latency_ms;

        let result = backoff::future::retry_notify(
            LinearBackoff::new(self.policy.base_delay, self.policy.max_attempts),
            move || async move {
                attempts.fetch_add(1, Ordering::Relaxed);
                let outcome = {
                    let _permit = this
                        .permits
                        .acquire()
                        .await
                        .map_err(|e| backoff::Error::permanent(ExchangeError::Other(e.to_string())))?;
                    let started = Instant::now();
                    let outcome = operation().await;
                    last_latency_ms.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                    outcome
                };

                match outcome {
                    Ok(value) => Ok(value),
                    Err(err) => match err.class() {
                        FailureClass::Critical => Err(backoff::Error::permanent(err)),
                        FailureClass::ClockSkew => {
                            this.sync_clock(true).await;
                            Err(backoff::Error::transient(err))
                        }
                        FailureClass::Transient | FailureClass::Unclassified => {
                            Err(backoff::Error::transient(err))
                        }
                    },
                }
            },
            |err: ExchangeError, wait: Duration| {
                warn!(
                    action,
                    error = %err,
                    retry_in_ms = wait.as_millis() as u64,
                    "Exchange call failed, retrying"
                );
            },
        )
        .await;

        match result {
            Ok(value) => {
                let latency = Duration::from_millis(last_latency_ms.load(Ordering::Relaxed));
                self.record_success(action, latency).await;
                Ok(value)
            }
            Err(source) => {
                self.record_failure().await;
                let attempts = attempts.load(Ordering::Relaxed);
                if source.class() == FailureClass::Critical || critical {
                    error!(action, attempts, error = %source, "Exchange call failed (critical)");
                    self.notifications.critical_error(action, &source.to_string());
                    Err(ServiceError::Critical {
                        action: action.to_string(),
                        source,
                    })
                } else {
                    warn!(action, attempts, error = %source, "Exchange call failed (transient)");
                    Err(ServiceError::Transient {
                        action: action.to_string(),
                        source,
                    })
                }
            }
        }
    }

    async fn record_success(&self, action: &str, latency: Duration) {
        if latency > self.policy.latency_threshold {
            warn!(
                action,
                latency_ms = latency.as_millis() as u64,
                threshold_ms = self.policy.latency_threshold.as_millis() as u64,
                "Slow exchange call"
            );
            self.record_failure().await;
            return;
        }
        self.breaker.lock().await.record_success();
    }

    /// Count a failure against the breaker, announcing if it opens.
    pub async fn record_failure(&self) {
        let event = self.breaker.lock().await.record_failure(Instant::now());
        if let Some(event) = event {
            self.announce(event);
        }
    }

    /// Close the breaker if its cooldown elapsed. Returns the remaining
    /// cooldown while it stays open.
    pub async fn poll_breaker(&self) -> Option<Duration> {
        let now = Instant::now();
        let (event, remaining) = {
            let mut breaker = self.breaker.lock().await;
            let event = breaker.poll(now);
            (event, breaker.remaining(now))
        };
        if let Some(event) = event {
            self.announce(event);
        }
        remaining
    }

    pub async fn breaker_status(&self) -> CircuitStatus {
        self.breaker.lock().await.status(Instant::now())
    }

    fn announce(&self, event: CircuitEvent) {
        match event {
            CircuitEvent::Opened { failures, cooldown } => {
                error!(failures, cooldown_secs = cooldown.as_secs(), "Circuit breaker opened");
                self.notifications.circuit_opened(failures, cooldown.as_secs());
            }
            CircuitEvent::Closed => {
                info!("Circuit breaker closed");
                self.notifications.circuit_closed();
            }
        }
    }

    /// Measure the server clock offset, at most once per sync interval
    /// unless forced.
    pub async fn sync_clock(&self, force: bool) {
        {
            let mut last = self.last_sync.lock().await;
            let due = force || last.map_or(true, |t| t.elapsed() >= self.policy.time_sync_interval);
            if !due {
                return;
            }
            *last = Some(Instant::now());
        }

        let local_before = Utc::now().timestamp_millis();
        match self.exchange.server_time().await {
            Ok(server_ms) => {
                let local_after = Utc::now().timestamp_millis();
                let offset = server_ms - (local_before + local_after) / 2;
                self.exchange.set_time_offset(offset);
                self.offset_ms.store(offset, Ordering::Relaxed);
                debug!(offset_ms = offset, forced = force, "Clock synchronized");
            }
            Err(e) => {
                warn!(error = %e, "Clock sync failed");
                *self.last_sync.lock().await = None;
            }
        }
    }

    pub fn clock_offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    // ==================== Exchange operations ====================

    pub async fn place_order(&self, order: &OrderRequest) -> Result<OrderReceipt, ServiceError> {
        let exchange = &self.exchange;
        self.execute("place_order", true, move || exchange.place_order(order)).await
    }

    pub async fn get_price(&self, symbol: &str) -> Result<Decimal, ServiceError> {
        let exchange = &self.exchange;
        self.execute("get_price", false, move || exchange.get_price(symbol)).await
    }

    pub async fn get_prices(&self, symbols: &[String]) -> Result<HashMap<String, Decimal>, ServiceError> {
        let exchange = &self.exchange;
        self.execute("get_prices", false, move || exchange.get_prices(symbols)).await
    }

    pub async fn open_orders(&self) -> Result<Vec<OpenOrder>, ServiceError> {
        let exchange = &self.exchange;
        self.execute("open_orders", false, move || exchange.open_orders()).await
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ServiceError> {
        let exchange = &self.exchange;
        self.execute("cancel_order", false, move || exchange.cancel_order(symbol, order_id)).await
    }

    pub async fn balance(&self, asset: &str) -> Result<Decimal, ServiceError> {
        let exchange = &self.exchange;
        self.execute("balance", false, move || exchange.balance(asset)).await
    }

    pub async fn liquidity(&self, symbol: &str) -> Result<Liquidity, ServiceError> {
        let exchange = &self.exchange;
        self.execute("liquidity", false, move || exchange.liquidity(symbol)).await
    }
}
