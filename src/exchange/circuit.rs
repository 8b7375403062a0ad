//! Consecutive-failure circuit breaker.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Breaker transition the caller should announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitEvent {
    Opened { failures: u32, cooldown: Duration },
    Closed,
}

/// Point-in-time view for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub consecutive_failures: u32,
    pub open: bool,
    pub reopens_in_secs: Option<u64>,
}

/// Opens after `threshold` consecutive failures and closes itself once
/// `cooldown` has elapsed. Time is passed in so callers control the clock.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            failures: 0,
            open_until: None,
        }
    }

    pub fn record_failure(&mut self, now: Instant) -> Option<CircuitEvent> {
        self.failures = self.failures.saturating_add(1);
        if self.open_until.is_none() && self.failures >= self.threshold {
            self.open_until = Some(now + self.cooldown);
            return Some(CircuitEvent::Opened {
                failures: self.failures,
                cooldown: self.cooldown,
            });
        }
        None
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// Close the breaker if its cooldown has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<CircuitEvent> {
        match self.open_until {
            Some(until) if now >= until => {
                self.open_until = None;
                self.failures = 0;
                Some(CircuitEvent::Closed)
            }
            _ => None,
        }
    }

    pub fn is_open(&self, now: Instant) -> bool {
        self.open_until.map_or(false, |until| now < until)
    }

    /// Time left until the breaker closes, if open.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.open_until
            .filter(|until| now < *until)
            .map(|until| until - now)
    }

    pub fn status(&self, now: Instant) -> CircuitStatus {
        CircuitStatus {
            consecutive_failures: self.failures,
            open: self.is_open(now),
            reopens_in_secs: self.remaining(now).map(|d| d.as_secs()),
        }
    }
}
