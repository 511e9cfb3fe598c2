use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;

/// Why a raw record did not become a market. Local to one record; discovery
/// keeps going.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionReason {
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("unsupported market shape: {0}")]
    UnsupportedMarketShape(String),

    #[error("market is closed")]
    Closed,

    #[error("market is not active")]
    Inactive,

    #[error("market expired on {expiry}")]
    Expired { expiry: NaiveDate },
}

impl RejectionReason {
    /// Stable label used when aggregating skip counts.
    pub fn kind(&self) -> &'static str {
        match self {
            RejectionReason::MalformedRecord(_) => "malformed_record",
            RejectionReason::UnsupportedMarketShape(_) => "unsupported_market_shape",
            RejectionReason::Closed => "closed",
            RejectionReason::Inactive => "inactive",
            RejectionReason::Expired { .. } => "expired",
        }
    }
}

/// Failure talking to the market record source. Transient: recorded on the
/// sample and never escalated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed quote: {0}")]
    MalformedQuote(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        SourceError::ProviderUnavailable(e.to_string())
    }
}

/// Caller misuse. Surfaced immediately, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("unknown market: {0}")]
    UnknownMarket(String),

    #[error("poller is already running")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}
