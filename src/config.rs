use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::SessionError;
use crate::filter::FilterCriteria;
use crate::pm::market_data::{ListingMode, CLOB_HOST, GAMMA_HOST};
use crate::poller::PollerConfig;
use crate::types::HistoryWindow;

const ACTIVE_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_gamma_host")]
    pub gamma_host: String,
    #[serde(default = "default_clob_host")]
    pub clob_host: String,

    // Discovery
    pub search_query: Option<String>,
    #[serde(default = "default_search_limit")]
    pub search_limit_per_type: usize,
    #[serde(default = "default_max_markets")]
    pub max_markets: usize,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    /// 0 disables periodic refresh.
    #[serde(default)]
    pub markets_refresh_sec: u64,

    // Polling
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: f64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_poll_concurrency")]
    pub poll_concurrency: usize,

    // History backfill for new subscriptions; 0 hours disables it.
    #[serde(default)]
    pub backfill_hours: u64,
    #[serde(default = "default_backfill_fidelity")]
    pub backfill_fidelity_min: u32,

    // Optional filters
    pub filter_text: Option<String>,
    pub filter_expiry_on: Option<String>,
    pub filter_min_strike: Option<String>,
    pub filter_max_strike: Option<String>,

    /// Comma separated; skips the prompt when set.
    pub select_ids: Option<String>,

    // Output
    #[serde(default = "default_stats_log_sec")]
    pub stats_log_sec: u64,
    pub stats_jsonl_path: Option<String>,
    pub samples_jsonl_path: Option<String>,
}

fn default_gamma_host() -> String {
    GAMMA_HOST.to_string()
}
fn default_clob_host() -> String {
    CLOB_HOST.to_string()
}
fn default_backfill_fidelity() -> u32 {
    5
}
fn default_search_limit() -> usize {
    50
}
fn default_max_markets() -> usize {
    500
}
fn default_discovery_timeout_ms() -> u64 {
    30_000
}
fn default_poll_interval() -> f64 {
    5.0
}
fn default_request_timeout_ms() -> u64 {
    5_000
}
fn default_poll_concurrency() -> usize {
    8
}
fn default_stats_log_sec() -> u64 {
    30
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_source(config::Environment::default())
    }

    fn from_source(env: config::Environment) -> anyhow::Result<Self> {
        let c = config::Config::builder().add_source(env).build()?;
        Ok(c.try_deserialize()?)
    }

    pub fn poll_interval(&self) -> Result<Duration, SessionError> {
        let secs = self.poll_interval_seconds;
        if !secs.is_finite() || secs <= 0.0 {
            return Err(SessionError::InvalidConfiguration(format!(
                "poll_interval_seconds must be positive, got {secs}"
            )));
        }
        Duration::try_from_secs_f64(secs)
            .map_err(|e| SessionError::InvalidConfiguration(format!("poll_interval_seconds: {e}")))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn markets_refresh(&self) -> Option<Duration> {
        (self.markets_refresh_sec > 0).then(|| Duration::from_secs(self.markets_refresh_sec))
    }

    pub fn backfill_window(&self, now: DateTime<Utc>) -> Option<HistoryWindow> {
        let hours = i64::try_from(self.backfill_hours).ok().filter(|h| *h > 0)?;
        let lookback = chrono::Duration::try_hours(hours)?;
        Some(HistoryWindow::trailing(now, lookback, self.backfill_fidelity_min))
    }

    pub fn poller_config(&self) -> Result<PollerConfig, SessionError> {
        Ok(PollerConfig {
            interval: self.poll_interval()?,
            request_timeout: self.request_timeout(),
            concurrency: self.poll_concurrency,
        })
    }

    pub fn listing_mode(&self) -> ListingMode {
        match non_empty(&self.search_query) {
            Some(q) => ListingMode::Search {
                query: q.to_string(),
                limit_per_type: self.search_limit_per_type,
            },
            None => ListingMode::Active {
                page_size: ACTIVE_PAGE_SIZE.min(self.max_markets.max(1)),
            },
        }
    }

    pub fn filter_criteria(&self) -> Result<FilterCriteria, SessionError> {
        let expiry_on = non_empty(&self.filter_expiry_on)
            .map(|v| {
                NaiveDate::parse_from_str(v, "%Y-%m-%d")
                    .map_err(|e| SessionError::InvalidConfiguration(format!("filter_expiry_on {v:?}: {e}")))
            })
            .transpose()?;

        let criteria = FilterCriteria {
            text_query: non_empty(&self.filter_text).map(str::to_string),
            expiry_on,
            min_strike: parse_opt_decimal("filter_min_strike", &self.filter_min_strike)?,
            max_strike: parse_opt_decimal("filter_max_strike", &self.filter_max_strike)?,
        };
        if let (Some(lo), Some(hi)) = (criteria.min_strike, criteria.max_strike) {
            if lo > hi {
                return Err(SessionError::InvalidConfiguration(format!(
                    "filter_min_strike {lo} exceeds filter_max_strike {hi}"
                )));
            }
        }
        Ok(criteria)
    }

    pub fn selected_ids(&self) -> Option<Vec<String>> {
        non_empty(&self.select_ids).map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|x| !x.is_empty())
                .map(str::to_string)
                .collect()
        })
    }
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_opt_decimal(name: &str, s: &Option<String>) -> Result<Option<Decimal>, SessionError> {
    non_empty(s)
        .map(|v| {
            v.parse::<Decimal>()
                .map_err(|e| SessionError::InvalidConfiguration(format!("{name} {v:?}: {e}")))
        })
        .transpose()
}
