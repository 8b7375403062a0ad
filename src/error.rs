//! Error taxonomy shared by the exchange layer and the control loop.

use thiserror::Error;

/// How a raw exchange failure should be treated by the retry layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Rate limits and connectivity blips: retry locally
    Transient,
    /// Timestamp outside the receive window: resync the clock, then retry
    ClockSkew,
    /// Rejected orders and auth failures: never retried
    Critical,
    /// Anything else: retried, then escalated per call site
    Unclassified,
}

/// A failure reported by an exchange implementation.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("connectivity: {0}")]
    Connectivity(String),

    #[error("timestamp outside recv window: {0}")]
    ClockSkew(String),

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

impl ExchangeError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::RateLimited(_) | Self::Connectivity(_) => FailureClass::Transient,
            Self::ClockSkew(_) => FailureClass::ClockSkew,
            Self::OrderRejected(_) | Self::Auth(_) => FailureClass::Critical,
            Self::Other(_) => FailureClass::Unclassified,
        }
    }

    /// Map a Binance API error code to a typed failure.
    pub fn from_api_code(code: i64, msg: String) -> Self {
        match code {
            -1003 | -1015 => Self::RateLimited(msg),
            -1001 => Self::Connectivity(msg),
            -1021 => Self::ClockSkew(msg),
            -1013 | -1111 | -2010 | -2011 => Self::OrderRejected(msg),
            -1022 | -2014 | -2015 => Self::Auth(msg),
            _ => Self::Other(format!("code {}: {}", code, msg)),
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            Self::Connectivity(e.to_string())
        } else {
            Self::Other(e.to_string())
        }
    }
}

/// Verdict of the resilience layer after retries are spent.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{action} failed (transient): {source}")]
    Transient {
        action: String,
        #[source]
        source: ExchangeError,
    },

    #[error("{action} failed (critical): {source}")]
    Critical {
        action: String,
        #[source]
        source: ExchangeError,
    },

    /// Refused without calling the exchange while the breaker is open.
    #[error("{action} skipped: circuit breaker open")]
    CircuitOpen { action: String },
}

impl ServiceError {
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical { .. })
    }
}

/// Errors surfaced by the orchestrator's public operations and ticks.
#[derive(Debug, Error)]
pub enum BotError {
    #[error(transparent)]
    Exchange(#[from] ServiceError),

    /// A deliberate stop of further entries, not a fault.
    #[error("trading halted: {0}")]
    PolicyHalt(String),

    #[error("bot is already running")]
    AlreadyRunning,

    #[error("bot is not running")]
    NotRunning,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_codes_classify() {
        assert_eq!(ExchangeError::from_api_code(-1003, "x".into()).class(), FailureClass::Transient);
        assert_eq!(ExchangeError::from_api_code(-1015, "x".into()).class(), FailureClass::Transient);
        assert_eq!(ExchangeError::from_api_code(-1001, "x".into()).class(), FailureClass::Transient);
        assert_eq!(ExchangeError::from_api_code(-1021, "x".into()).class(), FailureClass::ClockSkew);
        assert_eq!(ExchangeError::from_api_code(-2010, "x".into()).class(), FailureClass::Critical);
        assert_eq!(ExchangeError::from_api_code(-2015, "x".into()).class(), FailureClass::Critical);
        assert_eq!(ExchangeError::from_api_code(-9999, "x".into()).class(), FailureClass::Unclassified);
    }
}
