//! Timed price sampling over the subscription set.
//!
//! `Idle -> Running -> Stopped`. One spawned task owns the tick loop; each
//! tick snapshots the subscriptions, fetches every market independently
//! (bounded concurrency), and hands every resulting sample to the sink,
//! failures included.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{stream, StreamExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::error::{SessionError, SourceError};
use crate::normalize::interpret_quote;
use crate::sink::SampleSink;
use crate::source::MarketRecordSource;
use crate::stats::Stats;
use crate::subscription::SubscriptionSet;
use crate::types::{PriceSample, ThresholdBinaryMarket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Measured from tick start to tick start.
    pub interval: Duration,
    /// Per price request.
    pub request_timeout: Duration,
    /// Price requests in flight within one tick.
    pub concurrency: usize,
}

impl PollerConfig {
    fn validate(&self) -> Result<(), SessionError> {
        if self.interval.is_zero() {
            return Err(SessionError::InvalidConfiguration("poll interval must be positive".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(SessionError::InvalidConfiguration("request timeout must be positive".into()));
        }
        Ok(())
    }
}

pub struct PricePoller {
    config: PollerConfig,
    stats: Arc<Stats>,
    state: watch::Sender<PollerState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PricePoller {
    pub fn new(config: PollerConfig, stats: Arc<Stats>) -> Result<Self, SessionError> {
        config.validate()?;
        let (state, _) = watch::channel(PollerState::Idle);
        Ok(Self {
            config: PollerConfig {
                concurrency: config.concurrency.max(1),
                ..config
            },
            stats,
            state,
            task: Mutex::new(None),
        })
    }

    pub fn state(&self) -> PollerState {
        *self.state.borrow()
    }

    /// `Idle`/`Stopped -> Running`. The first tick fires immediately.
    pub async fn start(
        &self,
        subscriptions: Arc<SubscriptionSet>,
        source: Arc<dyn MarketRecordSource>,
        sink: Arc<dyn SampleSink>,
    ) -> Result<(), SessionError> {
        let mut task = self.task.lock().await;

        let mut accepted = false;
        self.state.send_if_modified(|s| {
            if *s == PollerState::Running {
                return false;
            }
            *s = PollerState::Running;
            accepted = true;
            true
        });
        if !accepted {
            return Err(SessionError::AlreadyRunning);
        }

        let ticker = Ticker {
            subscriptions,
            source,
            sink,
            stats: self.stats.clone(),
            request_timeout: self.config.request_timeout,
            concurrency: self.config.concurrency,
        };
        *task = Some(tokio::spawn(run_loop(ticker, self.config.interval, self.state.subscribe())));

        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            concurrency = self.config.concurrency,
            "poller started"
        );
        Ok(())
    }

    /// `Running -> Stopped`, then waits for the current tick to drain. No new
    /// tick starts after this is called. No-op unless running.
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;

        let stopped = self.state.send_if_modified(|s| {
            if *s != PollerState::Running {
                return false;
            }
            *s = PollerState::Stopped;
            true
        });
        if !stopped {
            return;
        }

        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "poll loop ended abnormally");
            }
        }
        tracing::info!("poller stopped");
    }
}

async fn run_loop(ticker: Ticker, interval: Duration, mut state: watch::Receiver<PollerState>) {
    let mut clock = tokio::time::interval(interval);
    // A slow tick is followed immediately by the next one, never by a burst.
    clock.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut state) => break,
            _ = clock.tick() => {}
        }
        ticker.tick().await;
    }
}

async fn stopped(state: &mut watch::Receiver<PollerState>) {
    // A dropped sender also ends the loop.
    let _ = state.wait_for(|s| *s != PollerState::Running).await;
}

struct Ticker {
    subscriptions: Arc<SubscriptionSet>,
    source: Arc<dyn MarketRecordSource>,
    sink: Arc<dyn SampleSink>,
    stats: Arc<Stats>,
    request_timeout: Duration,
    concurrency: usize,
}

impl Ticker {
    async fn tick(&self) {
        let tick_id = Uuid::new_v4();
        let markets = self.subscriptions.snapshot().await;
        self.stats.inc_tick();
        self.stats.set_subscribed(markets.len() as u64);

        if markets.is_empty() {
            tracing::debug!(tick_id = %tick_id, "tick with no subscriptions");
            return;
        }

        let started = Instant::now();
        let total = markets.len();
        let timeout = self.request_timeout;

        let mut samples = stream::iter(markets.into_iter().map(|m| {
            let source = self.source.clone();
            async move { sample_market(source.as_ref(), &m, tick_id, timeout).await }
        }))
        .buffer_unordered(self.concurrency);

        let mut failed = 0usize;
        while let Some(sample) = samples.next().await {
            self.stats.record_sample(sample.success);
            if sample.success {
                tracing::debug!(tick_id = %tick_id, market_id = %sample.market_id, prices = ?sample.prices, "sample");
            } else {
                failed += 1;
                tracing::warn!(
                    tick_id = %tick_id,
                    market_id = %sample.market_id,
                    error = sample.error.as_deref().unwrap_or(""),
                    "sample failed"
                );
            }
            self.sink.emit(sample).await;
        }

        tracing::debug!(
            tick_id = %tick_id,
            markets = total,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tick complete"
        );
    }
}

/// One market, one attempt. Always yields a sample.
pub async fn sample_market(
    source: &dyn MarketRecordSource,
    market: &ThresholdBinaryMarket,
    tick_id: Uuid,
    timeout: Duration,
) -> PriceSample {
    let quote = match tokio::time::timeout(timeout, source.get_price(market.id())).await {
        Ok(Ok(raw)) => interpret_quote(&raw),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(SourceError::Timeout(timeout)),
    };

    let sampled_at = Utc::now();
    match quote {
        Ok(q) => PriceSample::succeeded(tick_id, market, q, sampled_at),
        Err(e) => PriceSample::failed(tick_id, market, &e, sampled_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MarketCatalog;
    use crate::sink::testing::CollectingSink;
    use crate::source::testing::ScriptedSource;
    use crate::types::fixtures::{date, market};
    use rust_decimal_macros::dec;
    use std::collections::BTreeSet;
    use std::sync::atomic::Ordering;

    fn config(interval_secs: u64) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_secs(interval_secs),
            request_timeout: Duration::from_secs(60),
            concurrency: 4,
        }
    }

    fn catalog() -> MarketCatalog {
        MarketCatalog::from_markets([
            market("m1", "BTC > $100k on 2025-12-31", "BTC", dec!(100000), date(2025, 12, 31)),
            market("m2", "ETH > $4k on 2025-12-31", "ETH", dec!(4000), date(2025, 12, 31)),
            market("m3", "SOL > $300 on 2025-12-31", "SOL", dec!(300), date(2025, 12, 31)),
        ])
    }

    async fn subscribed(ids: &[&str]) -> Arc<SubscriptionSet> {
        let subs = Arc::new(SubscriptionSet::new());
        let c = catalog();
        for id in ids {
            subs.subscribe(id, &c).await.unwrap();
        }
        subs
    }

    #[test]
    fn test_rejects_non_positive_interval() {
        let err = PricePoller::new(config(0), Stats::new(0)).err().unwrap();
        assert!(matches!(err, SessionError::InvalidConfiguration(_)));

        let mut c = config(1);
        c.request_timeout = Duration::ZERO;
        assert!(PricePoller::new(c, Stats::new(0)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failing_market_does_not_abort_tick() {
        let source = Arc::new(ScriptedSource::default().failing("m2"));
        let sink = Arc::new(CollectingSink::default());
        let stats = Stats::new(0);
        let poller = PricePoller::new(config(60), stats.clone()).unwrap();

        poller
            .start(subscribed(&["m1", "m2", "m3"]).await, source, sink.clone())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        {
            let samples = sink.samples.lock().await;
            assert_eq!(samples.len(), 3);
            assert_eq!(samples.iter().filter(|s| s.success).count(), 2);
            let failed: Vec<_> = samples.iter().filter(|s| !s.success).collect();
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].market_id, "m2");
            assert!(failed[0].prices.is_none());
            assert!(failed[0].error.as_deref().unwrap().contains("unavailable"));
            let tick_ids: BTreeSet<_> = samples.iter().map(|s| s.tick_id).collect();
            assert_eq!(tick_ids.len(), 1);
        }
        assert_eq!(poller.state(), PollerState::Running);

        let snap = stats.snapshot(0);
        assert_eq!((snap.ticks, snap.samples_ok, snap.samples_failed), (1, 2, 1));
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_fails_and_first_run_continues() {
        let source = Arc::new(ScriptedSource::default());
        let sink = Arc::new(CollectingSink::default());
        let poller = PricePoller::new(config(10), Stats::new(0)).unwrap();
        let subs = subscribed(&["m1"]).await;

        poller.start(subs.clone(), source.clone(), sink.clone()).await.unwrap();
        let err = poller.start(subs, source, sink.clone()).await.unwrap_err();
        assert_eq!(err, SessionError::AlreadyRunning);
        assert_eq!(poller.state(), PollerState::Running);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(sink.samples.lock().await.len(), 2);
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_fixed_cadence() {
        let source = Arc::new(ScriptedSource::default());
        let sink = Arc::new(CollectingSink::default());
        let poller = PricePoller::new(config(10), Stats::new(0)).unwrap();

        poller.start(subscribed(&["m1", "m3"]).await, source, sink.clone()).await.unwrap();
        // ticks at 0, 10, 20, 30
        tokio::time::sleep(Duration::from_secs(35)).await;
        poller.stop().await;

        let samples = sink.samples.lock().await;
        assert_eq!(samples.len(), 8);
        assert!(samples.iter().all(|s| s.success));
        assert_eq!(samples.iter().map(|s| s.tick_id).collect::<BTreeSet<_>>().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tick_is_followed_immediately_without_backlog() {
        let source = Arc::new(ScriptedSource::default().delayed("m1", Duration::from_secs(25)));
        let sink = Arc::new(CollectingSink::default());
        let poller = PricePoller::new(config(10), Stats::new(0)).unwrap();

        poller.start(subscribed(&["m1"]).await, source.clone(), sink.clone()).await.unwrap();
        // requests go out at 0, 25, 50
        tokio::time::sleep(Duration::from_secs(51)).await;
        assert_eq!(source.price_calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.samples.lock().await.len(), 2);
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_yields_failed_sample() {
        let source = Arc::new(ScriptedSource::default().delayed("m1", Duration::from_secs(30)));
        let sink = Arc::new(CollectingSink::default());
        let mut c = config(60);
        c.request_timeout = Duration::from_secs(5);
        let poller = PricePoller::new(c, Stats::new(0)).unwrap();

        poller.start(subscribed(&["m1", "m2"]).await, source, sink.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        let samples = sink.samples.lock().await;
        assert_eq!(samples.len(), 2);
        let slow = samples.iter().find(|s| s.market_id == "m1").unwrap();
        assert!(!slow.success);
        assert_eq!(slow.error.as_deref(), Some("request timed out after 5s"));
        drop(samples);
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_wait_and_ends_ticking() {
        let source = Arc::new(ScriptedSource::default());
        let sink = Arc::new(CollectingSink::default());
        let poller = PricePoller::new(config(3600), Stats::new(0)).unwrap();

        poller.start(subscribed(&["m1"]).await, source, sink.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let before = tokio::time::Instant::now();
        poller.stop().await;
        assert!(before.elapsed() < Duration::from_secs(1));
        assert_eq!(poller.state(), PollerState::Stopped);

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(sink.samples.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drains_in_flight_requests() {
        let source = Arc::new(ScriptedSource::default().delayed("m1", Duration::from_secs(20)));
        let sink = Arc::new(CollectingSink::default());
        let poller = PricePoller::new(config(5), Stats::new(0)).unwrap();

        poller.start(subscribed(&["m1", "m2"]).await, source.clone(), sink.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        poller.stop().await;

        let samples = sink.samples.lock().await;
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.success));
        assert_eq!(source.price_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let poller = PricePoller::new(config(1), Stats::new(0)).unwrap();
        poller.stop().await;
        assert_eq!(poller.state(), PollerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let source = Arc::new(ScriptedSource::default());
        let sink = Arc::new(CollectingSink::default());
        let poller = PricePoller::new(config(10), Stats::new(0)).unwrap();
        let subs = subscribed(&["m1"]).await;

        poller.start(subs.clone(), source.clone(), sink.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        poller.stop().await;
        poller.stop().await;
        assert_eq!(poller.state(), PollerState::Stopped);

        poller.start(subs, source, sink.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(poller.state(), PollerState::Running);
        assert_eq!(sink.samples.lock().await.len(), 2);
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_changes_seen_by_next_tick() {
        let source = Arc::new(ScriptedSource::default());
        let sink = Arc::new(CollectingSink::default());
        let poller = PricePoller::new(config(10), Stats::new(0)).unwrap();
        let subs = subscribed(&["m1"]).await;

        poller.start(subs.clone(), source, sink.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        subs.subscribe("m2", &catalog()).await.unwrap();
        subs.unsubscribe("m1").await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        poller.stop().await;

        let samples = sink.samples.lock().await;
        let ids: Vec<_> = samples.iter().map(|s| s.market_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_and_concurrent_ticks_agree() {
        let mut outcomes = vec![];
        for concurrency in [1, 4] {
            let source = Arc::new(ScriptedSource::default().failing("m3"));
            let sink = Arc::new(CollectingSink::default());
            let mut c = config(60);
            c.concurrency = concurrency;
            let poller = PricePoller::new(c, Stats::new(0)).unwrap();
            poller
                .start(subscribed(&["m1", "m2", "m3"]).await, source, sink.clone())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            poller.stop().await;

            let got: BTreeSet<(String, bool, Option<[rust_decimal::Decimal; 2]>)> = sink
                .samples
                .lock()
                .await
                .iter()
                .map(|s| (s.market_id.clone(), s.success, s.prices))
                .collect();
            outcomes.push(got);
        }
        assert_eq!(outcomes[0], outcomes[1]);
        assert_eq!(outcomes[0].len(), 3);
    }

    #[tokio::test]
    async fn test_sample_market_rejects_malformed_quote() {
        struct BadQuotes;

        #[async_trait::async_trait]
        impl MarketRecordSource for BadQuotes {
            async fn list_markets(&self) -> Result<Vec<crate::types::RawRecord>, SourceError> {
                Ok(vec![])
            }
            async fn get_price(&self, _: &str) -> Result<crate::types::RawQuote, SourceError> {
                Ok(crate::types::RawQuote(serde_json::json!({ "outcomePrices": "[\"0.9\", \"0.9\"]" })))
            }
            async fn price_history(
                &self,
                _: &str,
                _: &crate::types::HistoryWindow,
            ) -> Result<crate::types::RawHistory, SourceError> {
                Ok(crate::types::RawHistory(serde_json::json!({ "history": [] })))
            }
        }

        let m = market("m1", "BTC > $100k on 2025-12-31", "BTC", dec!(100000), date(2025, 12, 31));
        let s = sample_market(&BadQuotes, &m, Uuid::new_v4(), Duration::from_secs(1)).await;
        assert!(!s.success);
        assert!(s.error.unwrap().starts_with("malformed quote"));
    }
}
