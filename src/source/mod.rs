pub mod polymarket;

use async_trait::async_trait;

use crate::error::SourceError;
use crate::types::{HistoryWindow, RawHistory, RawQuote, RawRecord};

/// Abstraction for market record sources (Polymarket Gamma today).
#[async_trait]
pub trait MarketRecordSource: Send + Sync {
    /// Fetch the current market listing, unparsed
    async fn list_markets(&self) -> Result<Vec<RawRecord>, SourceError>;

    /// Fetch a fresh quote for one market
    async fn get_price(&self, market_id: &str) -> Result<RawQuote, SourceError>;

    /// Fetch one outcome token's price history over `window`
    async fn price_history(&self, token_id: &str, window: &HistoryWindow) -> Result<RawHistory, SourceError>;
}

pub use polymarket::PolymarketSource;
