use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct Stats {
    start_ms: AtomicU64,

    ticks: AtomicU64,
    samples_ok: AtomicU64,
    samples_failed: AtomicU64,
    samples_backfilled: AtomicU64,

    catalog_size: AtomicU64,
    records_skipped: AtomicU64,
    subscribed: AtomicU64,
}

impl Stats {
    pub fn new(now_ms: u64) -> Arc<Self> {
        let s = Arc::new(Self::default());
        s.start_ms.store(now_ms, Ordering::Relaxed);
        s
    }

    pub fn inc_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sample(&self, success: bool) {
        if success {
            self.samples_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.samples_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_backfill(&self, n: u64) {
        self.samples_backfilled.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_catalog(&self, size: u64, skipped: u64) {
        self.catalog_size.store(size, Ordering::Relaxed);
        self.records_skipped.store(skipped, Ordering::Relaxed);
    }

    pub fn set_subscribed(&self, n: u64) {
        self.subscribed.store(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, now_ms: u64) -> StatsSnapshot {
        let start = self.start_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            now_ms,
            up_sec: now_ms.saturating_sub(start) / 1000,
            ticks: self.ticks.load(Ordering::Relaxed),
            samples_ok: self.samples_ok.load(Ordering::Relaxed),
            samples_failed: self.samples_failed.load(Ordering::Relaxed),
            samples_backfilled: self.samples_backfilled.load(Ordering::Relaxed),
            catalog_size: self.catalog_size.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            subscribed: self.subscribed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub now_ms: u64,
    pub up_sec: u64,
    pub ticks: u64,
    pub samples_ok: u64,
    pub samples_failed: u64,
    pub samples_backfilled: u64,
    pub catalog_size: u64,
    pub records_skipped: u64,
    pub subscribed: u64,
}
