//! Discovery pass: raw listing -> normalized [`MarketCatalog`] snapshot.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::RwLock;

use crate::error::SourceError;
use crate::normalize::normalize;
use crate::source::MarketRecordSource;
use crate::types::{RawRecord, ThresholdBinaryMarket};

/// Immutable id -> market snapshot from one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct MarketCatalog {
    markets: HashMap<String, ThresholdBinaryMarket>,
}

impl MarketCatalog {
    /// Normalize every record; bad records are counted, never fatal. When the
    /// listing repeats an id the first occurrence wins.
    pub fn build(records: &[RawRecord], as_of: NaiveDate) -> (Self, SkipReport) {
        let mut markets: HashMap<String, ThresholdBinaryMarket> = HashMap::with_capacity(records.len());
        let mut report = SkipReport::default();

        for raw in records {
            match normalize(raw, as_of) {
                Ok(m) => {
                    if markets.contains_key(m.id()) {
                        report.record("duplicate_id");
                        continue;
                    }
                    markets.insert(m.id().to_string(), m);
                }
                Err(reason) => {
                    tracing::trace!(reason = %reason, "record skipped");
                    report.record(reason.kind());
                }
            }
        }

        report.accepted = markets.len();
        (Self { markets }, report)
    }

    pub fn from_markets(markets: impl IntoIterator<Item = ThresholdBinaryMarket>) -> Self {
        Self {
            markets: markets.into_iter().map(|m| (m.id().to_string(), m)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ThresholdBinaryMarket> {
        self.markets.get(id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.markets.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    pub fn markets(&self) -> impl Iterator<Item = &ThresholdBinaryMarket> {
        self.markets.values()
    }
}

/// How many records a discovery pass kept, and why it dropped the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipReport {
    pub accepted: usize,
    pub skipped: BTreeMap<&'static str, usize>,
}

impl SkipReport {
    fn record(&mut self, kind: &'static str) {
        *self.skipped.entry(kind).or_default() += 1;
    }

    pub fn total_skipped(&self) -> usize {
        self.skipped.values().sum()
    }
}

impl fmt::Display for SkipReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.skipped.is_empty() {
            return write!(f, "none");
        }
        let parts: Vec<String> = self.skipped.iter().map(|(k, n)| format!("{k}={n}")).collect();
        write!(f, "{}", parts.join(" "))
    }
}

/// Owns the latest catalog snapshot. A refresh swaps the whole `Arc`, so
/// readers holding the previous snapshot keep a consistent view.
pub struct Discovery {
    source: Arc<dyn MarketRecordSource>,
    timeout: Duration,
    current: RwLock<Arc<MarketCatalog>>,
}

impl Discovery {
    pub fn new(source: Arc<dyn MarketRecordSource>, timeout: Duration) -> Self {
        Self {
            source,
            timeout,
            current: RwLock::new(Arc::new(MarketCatalog::default())),
        }
    }

    #[cfg(test)]
    pub async fn current(&self) -> Arc<MarketCatalog> {
        self.current.read().await.clone()
    }

    /// On failure the previous snapshot stays in place.
    pub async fn refresh(&self, as_of: NaiveDate) -> Result<(Arc<MarketCatalog>, SkipReport), SourceError> {
        let records = match tokio::time::timeout(self.timeout, self.source.list_markets()).await {
            Ok(r) => r?,
            Err(_) => return Err(SourceError::Timeout(self.timeout)),
        };

        let (catalog, report) = MarketCatalog::build(&records, as_of);
        let catalog = Arc::new(catalog);
        *self.current.write().await = catalog.clone();

        tracing::info!(
            records = records.len(),
            markets = report.accepted,
            skipped = report.total_skipped(),
            reasons = %report,
            "catalog refreshed"
        );

        Ok((catalog, report))
    }
}
