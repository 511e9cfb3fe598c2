use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{PriceSample, SampleOrigin};

/// Consumer of emitted samples. Infallible from the poller's point of view:
/// a sink that cannot deliver logs and moves on.
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn emit(&self, sample: PriceSample);
}

/// One line per sample on stdout.
pub struct TerminalSink;

impl TerminalSink {
    pub fn format(sample: &PriceSample) -> String {
        let ts = sample.sampled_at.format("%Y-%m-%d %H:%M:%S%.3f");
        match (&sample.prices, &sample.error) {
            (Some([p0, p1]), _) => {
                let [o0, o1] = &sample.outcome_tokens;
                let mut line = format!(
                    "{ts}  {:<10}  {}={:.4}  {}={:.4}",
                    sample.market_id, o0.label, p0, o1.label, p1
                );
                if let Some(yes) = sample.book.first() {
                    let fmt = |p: Option<rust_decimal::Decimal>| p.map(|v| v.to_string()).unwrap_or_else(|| "N/A".into());
                    line.push_str(&format!("  bid/ask {} / {}", fmt(yes.best_bid_px), fmt(yes.best_ask_px)));
                }
                if sample.origin == SampleOrigin::History {
                    line.push_str("  [history]");
                }
                line
            }
            (None, err) => format!(
                "{ts}  {:<10}  FAILED {}",
                sample.market_id,
                err.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

#[async_trait]
impl SampleSink for TerminalSink {
    async fn emit(&self, sample: PriceSample) {
        println!("{}", Self::format(&sample));
    }
}

/// Appends each sample as one JSON line.
pub struct JsonlSink {
    path: String,
}

impl JsonlSink {
    pub fn new(path: String) -> Self {
        Self { path }
    }
}

#[async_trait]
impl SampleSink for JsonlSink {
    async fn emit(&self, sample: PriceSample) {
        match serde_json::to_string(&sample) {
            Ok(line) => append_jsonl(&self.path, &line).await,
            Err(e) => tracing::warn!(error = %e, market_id = %sample.market_id, "sample encode failed"),
        }
    }
}

/// Forwards every sample to each inner sink, in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn SampleSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn SampleSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl SampleSink for FanoutSink {
    async fn emit(&self, sample: PriceSample) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for s in rest {
                s.emit(sample.clone()).await;
            }
            last.emit(sample).await;
        }
    }
}

pub async fn append_jsonl(path: &str, line: &str) {
    use tokio::io::AsyncWriteExt;

    let path = path.trim();
    if path.is_empty() {
        return;
    }
    match tokio::fs::OpenOptions::new().create(true).append(true).open(path).await {
        Ok(mut f) => {
            let mut buf = Vec::with_capacity(line.len() + 1);
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
            if let Err(e) = f.write_all(&buf).await {
                tracing::warn!(error = %e, path = %path, "jsonl write failed");
            }
        }
        Err(e) => tracing::warn!(error = %e, path = %path, "jsonl open failed"),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct CollectingSink {
        pub samples: Mutex<Vec<PriceSample>>,
    }

    #[async_trait]
    impl SampleSink for CollectingSink {
        async fn emit(&self, sample: PriceSample) {
            self.samples.lock().await.push(sample);
        }
    }
}
