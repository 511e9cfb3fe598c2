//! Seeds new subscriptions with recent price history before live polling.

use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use uuid::Uuid;

use crate::error::SourceError;
use crate::normalize::interpret_history;
use crate::sink::SampleSink;
use crate::source::MarketRecordSource;
use crate::stats::Stats;
use crate::types::{HistoryPoint, HistoryWindow, PriceSample, ThresholdBinaryMarket};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub markets_seeded: usize,
    pub markets_failed: usize,
    pub samples: usize,
}

pub struct Backfill {
    source: Arc<dyn MarketRecordSource>,
    stats: Arc<Stats>,
    request_timeout: Duration,
    concurrency: usize,
}

impl Backfill {
    pub fn new(
        source: Arc<dyn MarketRecordSource>,
        stats: Arc<Stats>,
        request_timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            stats,
            request_timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// Emits each market's history as samples, oldest first, one market after
    /// another in input order. A market whose history cannot be fetched is
    /// logged and skipped.
    pub async fn seed(
        &self,
        markets: &[ThresholdBinaryMarket],
        window: &HistoryWindow,
        sink: &dyn SampleSink,
    ) -> BackfillReport {
        let batch_id = Uuid::new_v4();
        let mut report = BackfillReport::default();

        let mut fetched = stream::iter(markets.iter().map(|m| async move { (m, self.fetch(m, window).await) }))
            .buffered(self.concurrency);

        while let Some((m, res)) = fetched.next().await {
            match res {
                Ok(points) => {
                    report.markets_seeded += 1;
                    report.samples += points.len();
                    self.stats.record_backfill(points.len() as u64);
                    tracing::debug!(market_id = %m.id(), points = points.len(), "history fetched");
                    for p in &points {
                        sink.emit(PriceSample::historical(batch_id, m, p)).await;
                    }
                }
                Err(e) => {
                    report.markets_failed += 1;
                    tracing::warn!(market_id = %m.id(), error = %e, "history backfill failed");
                }
            }
        }

        tracing::info!(
            batch_id = %batch_id,
            seeded = report.markets_seeded,
            failed = report.markets_failed,
            samples = report.samples,
            "history backfill complete"
        );
        report
    }

    async fn fetch(&self, market: &ThresholdBinaryMarket, window: &HistoryWindow) -> Result<Vec<HistoryPoint>, SourceError> {
        let token_id = &market.outcome_tokens()[0].token_id;
        let raw = match tokio::time::timeout(self.request_timeout, self.source.price_history(token_id, window)).await {
            Ok(r) => r?,
            Err(_) => return Err(SourceError::Timeout(self.request_timeout)),
        };
        interpret_history(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::CollectingSink;
    use crate::source::testing::ScriptedSource;
    use crate::types::fixtures::{date, market};
    use crate::types::SampleOrigin;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn markets() -> Vec<ThresholdBinaryMarket> {
        vec![
            market("m1", "BTC > $100k on 2025-12-31", "BTC", dec!(100000), date(2025, 12, 31)),
            market("m2", "ETH > $4k on 2025-12-31", "ETH", dec!(4000), date(2025, 12, 31)),
        ]
    }

    fn window() -> HistoryWindow {
        let end = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        HistoryWindow::trailing(end, chrono::Duration::hours(24), 5)
    }

    fn backfill(source: ScriptedSource, stats: Arc<Stats>) -> Backfill {
        Backfill::new(Arc::new(source), stats, Duration::from_secs(5), 4)
    }

    #[tokio::test]
    async fn test_seed_emits_history_oldest_first_and_skips_failures() {
        let source = ScriptedSource::default().with_history(
            "m1-yes",
            json!({ "history": [
                { "t": 1748772300, "p": 0.42 },
                { "t": 1748772000, "p": "0.40" }
            ]}),
        );
        let stats = Stats::new(0);
        let sink = CollectingSink::default();

        let report = backfill(source, stats.clone()).seed(&markets(), &window(), &sink).await;
        assert_eq!(
            report,
            BackfillReport { markets_seeded: 1, markets_failed: 1, samples: 2 }
        );

        let samples = sink.samples.lock().await;
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.market_id == "m1" && s.origin == SampleOrigin::History));
        assert_eq!(samples[0].prices, Some([dec!(0.40), dec!(0.60)]));
        assert_eq!(samples[1].prices, Some([dec!(0.42), dec!(0.58)]));
        assert!(samples[0].sampled_at < samples[1].sampled_at);
        assert_eq!(samples[0].tick_id, samples[1].tick_id);
        assert_eq!(stats.snapshot(0).samples_backfilled, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_history_times_out() {
        let source = ScriptedSource::default()
            .with_history("m1-yes", json!({ "history": [{ "t": 1748772000, "p": 0.5 }] }))
            .with_history("m2-yes", json!({ "history": [{ "t": 1748772000, "p": 0.5 }] }))
            .delayed("m1-yes", Duration::from_secs(30));
        let sink = CollectingSink::default();

        let report = backfill(source, Stats::new(0)).seed(&markets(), &window(), &sink).await;
        assert_eq!(report.markets_failed, 1);
        assert_eq!(report.markets_seeded, 1);
        assert_eq!(sink.samples.lock().await[0].market_id, "m2");
    }

    #[tokio::test]
    async fn test_empty_history_seeds_nothing() {
        let source = ScriptedSource::default()
            .with_history("m1-yes", json!({ "history": [] }))
            .with_history("m2-yes", json!({}));
        let sink = CollectingSink::default();

        let report = backfill(source, Stats::new(0)).seed(&markets(), &window(), &sink).await;
        assert_eq!(report, BackfillReport { markets_seeded: 2, markets_failed: 0, samples: 0 });
        assert!(sink.samples.lock().await.is_empty());
    }
}
