use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RejectionReason, SourceError};

/// A market listing exactly as the provider returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub serde_json::Value);

/// A price response exactly as the provider returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawQuote(pub serde_json::Value);

/// A `/prices-history` response exactly as the provider returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawHistory(pub serde_json::Value);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdDirection {
    Above,
    Below,
}

impl ThresholdDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdDirection::Above => "above",
            ThresholdDirection::Below => "below",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutcomeToken {
    pub label: String,
    pub token_id: String,
}

/// Everything needed to build a [`ThresholdBinaryMarket`]; validated by
/// [`ThresholdBinaryMarket::new`].
#[derive(Debug, Clone)]
pub struct MarketTerms {
    pub id: String,
    pub title: String,
    pub underlying: String,
    pub strike: Decimal,
    pub direction: ThresholdDirection,
    pub expiry: NaiveDate,
    pub outcome_tokens: [OutcomeToken; 2],
    pub event_title: Option<String>,
    pub event_id: Option<String>,
}

/// A two-outcome market that resolves on `expiry` by whether `underlying`
/// ends up above/below `strike`.
///
/// Fields are private: the only way in is [`ThresholdBinaryMarket::new`],
/// so a value of this type has already passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThresholdBinaryMarket {
    id: String,
    title: String,
    underlying: String,
    strike: Decimal,
    direction: ThresholdDirection,
    expiry: NaiveDate,
    outcome_tokens: [OutcomeToken; 2],
    event_title: Option<String>,
    event_id: Option<String>,
}

impl ThresholdBinaryMarket {
    pub fn new(terms: MarketTerms, as_of: NaiveDate) -> Result<Self, RejectionReason> {
        let id = terms.id.trim().to_string();
        let title = terms.title.trim().to_string();
        let underlying = terms.underlying.trim().to_string();

        if id.is_empty() {
            return Err(RejectionReason::MalformedRecord("empty id".into()));
        }
        if title.is_empty() {
            return Err(RejectionReason::MalformedRecord("empty title".into()));
        }
        if underlying.is_empty() {
            return Err(RejectionReason::MalformedRecord("empty underlying".into()));
        }
        if terms.expiry < as_of {
            return Err(RejectionReason::Expired { expiry: terms.expiry });
        }

        let [first, second] = &terms.outcome_tokens;
        if first.token_id.trim().is_empty() || second.token_id.trim().is_empty() {
            return Err(RejectionReason::MalformedRecord("empty outcome token id".into()));
        }
        if first.token_id == second.token_id {
            return Err(RejectionReason::UnsupportedMarketShape(
                "both outcomes share one token id".into(),
            ));
        }

        Ok(Self {
            id,
            title,
            underlying,
            strike: terms.strike,
            direction: terms.direction,
            expiry: terms.expiry,
            outcome_tokens: terms.outcome_tokens,
            event_title: terms.event_title.filter(|t| !t.trim().is_empty()),
            event_id: terms
                .event_id
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn underlying(&self) -> &str {
        &self.underlying
    }

    pub fn strike(&self) -> Decimal {
        self.strike
    }

    pub fn direction(&self) -> ThresholdDirection {
        self.direction
    }

    pub fn expiry(&self) -> NaiveDate {
        self.expiry
    }

    pub fn outcome_tokens(&self) -> &[OutcomeToken; 2] {
        &self.outcome_tokens
    }

    pub fn event_title(&self) -> Option<&str> {
        self.event_title.as_deref()
    }

    /// Grouping event on the provider side, when the listing carried one.
    pub fn event_id(&self) -> Option<&str> {
        self.event_id.as_deref()
    }
}

/// Top of book for one outcome token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeTop {
    pub token_id: String,
    pub best_bid_px: Option<Decimal>,
    pub best_ask_px: Option<Decimal>,
}

/// Time range and bucket size for a price history request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// One of 1, 5, 15, 60, 1440.
    pub fidelity_minutes: u32,
}

impl HistoryWindow {
    /// The `lookback` ending at `end`. Bucket sizes snap to what the
    /// provider serves: 30 and 60 become hourly, anything from a day up
    /// becomes daily, other values fall back to 5 minutes.
    pub fn trailing(end: DateTime<Utc>, lookback: chrono::Duration, fidelity_minutes: u32) -> Self {
        let fidelity_minutes = match fidelity_minutes {
            1 | 5 | 15 => fidelity_minutes,
            30 | 60 => 60,
            m if m >= 1440 => 1440,
            _ => 5,
        };
        Self {
            start: end - lookback,
            end,
            fidelity_minutes,
        }
    }
}

/// One point of an outcome token's price history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPoint {
    pub at: DateTime<Utc>,
    pub price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleOrigin {
    /// Polled by the live ticker.
    #[default]
    Live,
    /// Replayed from price history when the subscription started.
    History,
}

/// A validated price response: one probability per outcome, in outcome order.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub prices: [Decimal; 2],
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceSample {
    pub tick_id: Uuid,
    pub market_id: String,
    pub outcome_tokens: [OutcomeToken; 2],
    pub prices: Option<[Decimal; 2]>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub book: Vec<OutcomeTop>,
    pub sampled_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub origin: SampleOrigin,
}

impl PriceSample {
    pub fn succeeded(
        tick_id: Uuid,
        market: &ThresholdBinaryMarket,
        quote: Quote,
        sampled_at: DateTime<Utc>,
    ) -> Self {
        let [yes, no] = market.outcome_tokens();

        // NO side mirrors YES: bid_no = 1 - ask_yes, ask_no = 1 - bid_yes.
        let book = if quote.best_bid.is_some() || quote.best_ask.is_some() {
            vec![
                OutcomeTop {
                    token_id: yes.token_id.clone(),
                    best_bid_px: quote.best_bid,
                    best_ask_px: quote.best_ask,
                },
                OutcomeTop {
                    token_id: no.token_id.clone(),
                    best_bid_px: quote.best_ask.map(|a| Decimal::ONE - a),
                    best_ask_px: quote.best_bid.map(|b| Decimal::ONE - b),
                },
            ]
        } else {
            vec![]
        };

        Self {
            tick_id,
            market_id: market.id().to_string(),
            outcome_tokens: market.outcome_tokens().clone(),
            prices: Some(quote.prices),
            book,
            sampled_at,
            success: true,
            error: None,
            origin: SampleOrigin::Live,
        }
    }

    pub fn failed(
        tick_id: Uuid,
        market: &ThresholdBinaryMarket,
        error: &SourceError,
        sampled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tick_id,
            market_id: market.id().to_string(),
            outcome_tokens: market.outcome_tokens().clone(),
            prices: None,
            book: vec![],
            sampled_at,
            success: false,
            error: Some(error.to_string()),
            origin: SampleOrigin::Live,
        }
    }

    /// A history point for the first outcome; the second is its complement.
    pub fn historical(batch_id: Uuid, market: &ThresholdBinaryMarket, point: &HistoryPoint) -> Self {
        Self {
            tick_id: batch_id,
            market_id: market.id().to_string(),
            outcome_tokens: market.outcome_tokens().clone(),
            prices: Some([point.price, Decimal::ONE - point.price]),
            book: vec![],
            sampled_at: point.at,
            success: true,
            error: None,
            origin: SampleOrigin::History,
        }
    }
}
