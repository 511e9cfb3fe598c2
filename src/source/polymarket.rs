use std::time::Duration;

use async_trait::async_trait;

use crate::error::SourceError;
use crate::pm::market_data::{ClobHistory, GammaMarkets, ListingMode};
use crate::source::MarketRecordSource;
use crate::types::{HistoryWindow, RawHistory, RawQuote, RawRecord};

/// Polymarket: listings and quotes from Gamma, price history from the CLOB.
pub struct PolymarketSource {
    markets: GammaMarkets,
    history: ClobHistory,
}

impl PolymarketSource {
    pub fn new(
        gamma_host: String,
        clob_host: String,
        mode: ListingMode,
        max_markets: usize,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            markets: GammaMarkets::new(gamma_host, mode, max_markets, timeout)?,
            history: ClobHistory::new(clob_host, timeout)?,
        })
    }
}

#[async_trait]
impl MarketRecordSource for PolymarketSource {
    async fn list_markets(&self) -> Result<Vec<RawRecord>, SourceError> {
        self.markets.list_markets().await
    }

    async fn get_price(&self, market_id: &str) -> Result<RawQuote, SourceError> {
        self.markets.fetch_market(market_id).await
    }

    async fn price_history(&self, token_id: &str, window: &HistoryWindow) -> Result<RawHistory, SourceError> {
        self.history.prices_history(token_id, window).await
    }
}
