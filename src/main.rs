mod backfill;
mod catalog;
mod config;
mod error;
mod filter;
mod normalize;
mod pm;
mod poller;
mod selection;
mod sink;
mod source;
mod stats;
mod subscription;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::backfill::Backfill;
use crate::catalog::Discovery;
use crate::config::Settings;
use crate::filter::filter;
use crate::poller::PricePoller;
use crate::selection::{PromptSelection, ScriptedSelection, SelectionProvider};
use crate::sink::{append_jsonl, FanoutSink, JsonlSink, SampleSink, TerminalSink};
use crate::source::{MarketRecordSource, PolymarketSource};
use crate::stats::Stats;
use crate::subscription::SubscriptionSet;

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

fn today() -> chrono::NaiveDate {
    chrono::Utc::now().date_naive()
}

async fn log_stats(stats: &Stats, jsonl_path: &Option<String>) {
    let ss = stats.snapshot(now_ms());
    tracing::info!(
        up_sec = ss.up_sec,
        ticks = ss.ticks,
        samples_ok = ss.samples_ok,
        samples_failed = ss.samples_failed,
        samples_backfilled = ss.samples_backfilled,
        catalog_size = ss.catalog_size,
        records_skipped = ss.records_skipped,
        subscribed = ss.subscribed,
        "stats"
    );
    if let Some(path) = jsonl_path {
        match serde_json::to_string(&ss) {
            Ok(line) => append_jsonl(path, &line).await,
            Err(e) => tracing::warn!(error = %e, "stats encode failed"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let s = Settings::from_env().context("load settings")?;
    let criteria = s.filter_criteria()?;
    let poller_cfg = s.poller_config()?;
    let stats = Stats::new(now_ms());

    let source: Arc<dyn MarketRecordSource> = Arc::new(
        PolymarketSource::new(
            s.gamma_host.clone(),
            s.clob_host.clone(),
            s.listing_mode(),
            s.max_markets,
            s.request_timeout(),
        )
        .context("build market source")?,
    );

    let discovery = Discovery::new(source.clone(), s.discovery_timeout());
    tracing::info!(host = %s.gamma_host, mode = ?s.listing_mode(), max_markets = s.max_markets, "discovering markets");
    let (catalog, report) = discovery.refresh(today()).await.context("market discovery")?;
    stats.set_catalog(catalog.len() as u64, report.total_skipped() as u64);

    let candidates = filter(&catalog, &criteria);
    tracing::info!(matches = candidates.len(), criteria = ?criteria, "markets matching filter");
    if candidates.is_empty() {
        tracing::warn!("no markets match the filter, nothing to watch");
        return Ok(());
    }

    let selector: Box<dyn SelectionProvider> = match s.selected_ids() {
        Some(ids) => Box::new(ScriptedSelection::new(ids)),
        None => Box::new(PromptSelection::stdin()),
    };
    let chosen = selector.select(&candidates).await.context("market selection")?;

    let subs = Arc::new(SubscriptionSet::new());
    for id in &chosen {
        if let Err(e) = subs.subscribe(id, &catalog).await {
            tracing::warn!(error = %e, "selection skipped");
        }
    }
    if subs.is_empty().await {
        tracing::warn!("no markets subscribed, nothing to watch");
        return Ok(());
    }
    stats.set_subscribed(subs.len().await as u64);
    tracing::info!(ids = ?subs.members().await, "watching markets");

    let mut sinks: Vec<Arc<dyn SampleSink>> = vec![Arc::new(TerminalSink)];
    if let Some(p) = s.samples_jsonl_path.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        sinks.push(Arc::new(JsonlSink::new(p.to_string())));
    }
    let sink: Arc<dyn SampleSink> = Arc::new(FanoutSink::new(sinks));

    if let Some(window) = s.backfill_window(chrono::Utc::now()) {
        let backfill = Backfill::new(source.clone(), stats.clone(), s.request_timeout(), s.poll_concurrency);
        backfill.seed(&subs.snapshot().await, &window, sink.as_ref()).await;
    }

    let poller = PricePoller::new(poller_cfg, stats.clone())?;
    poller.start(subs.clone(), source.clone(), sink).await?;

    let stats_on = s.stats_log_sec > 0;
    let mut stats_every = tokio::time::interval(Duration::from_secs(s.stats_log_sec.max(1)));
    stats_every.tick().await;

    let refresh_period = s.markets_refresh();
    let mut refresh_every = tokio::time::interval(refresh_period.unwrap_or(Duration::from_secs(3600)));
    refresh_every.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            r = &mut shutdown => {
                if let Err(e) = r {
                    tracing::error!(error = %e, "ctrl-c handler failed");
                }
                tracing::info!("shutdown requested");
                break;
            }
            _ = stats_every.tick(), if stats_on => {
                log_stats(&stats, &s.stats_jsonl_path).await;
            }
            _ = refresh_every.tick(), if refresh_period.is_some() => {
                match discovery.refresh(today()).await {
                    Ok((catalog, report)) => {
                        stats.set_catalog(catalog.len() as u64, report.total_skipped() as u64);
                        let missing = subs.rebase(&catalog).await;
                        if missing > 0 {
                            tracing::warn!(missing, "subscribed markets absent from refreshed catalog");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "catalog refresh failed, keeping previous snapshot"),
                }
            }
        }
    }

    poller.stop().await;
    tracing::info!(state = ?poller.state(), "session ended");
    log_stats(&stats, &s.stats_jsonl_path).await;
    Ok(())
}
