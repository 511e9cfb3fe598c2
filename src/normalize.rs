//! Raw provider records -> [`ThresholdBinaryMarket`], raw quotes -> [`Quote`].
//!
//! This is the only place untyped provider JSON is looked at. Everything is
//! pure: the reference date for expiry checks is passed in.

use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::de::{self, Deserializer};
use serde::Deserialize;

use crate::error::{RejectionReason, SourceError};
use crate::types::{
    HistoryPoint, MarketTerms, OutcomeToken, Quote, RawHistory, RawQuote, RawRecord,
    ThresholdBinaryMarket, ThresholdDirection,
};

/// Outcome prices of a binary market must add up to 1 within this much.
pub const PRICE_SUM_TOLERANCE: Decimal = dec!(0.02);

const DEFAULT_OUTCOMES: [&str; 2] = ["Yes", "No"];

/// Known asset names in titles, mapped to their ticker.
const ASSET_ALIASES: &[(&str, &str)] = &[
    ("bitcoin", "BTC"),
    ("btc", "BTC"),
    ("ethereum", "ETH"),
    ("ether", "ETH"),
    ("eth", "ETH"),
    ("solana", "SOL"),
    ("sol", "SOL"),
    ("xrp", "XRP"),
    ("dogecoin", "DOGE"),
    ("doge", "DOGE"),
    ("cardano", "ADA"),
    ("avalanche", "AVAX"),
    ("chainlink", "LINK"),
    ("gold", "GOLD"),
    ("s&p 500", "SPX"),
];

pub fn normalize(raw: &RawRecord, as_of: NaiveDate) -> Result<ThresholdBinaryMarket, RejectionReason> {
    let rec: GammaRecord = serde_json::from_value(raw.0.clone())
        .map_err(|e| RejectionReason::MalformedRecord(e.to_string()))?;

    let title = rec
        .question
        .or(rec.title)
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| RejectionReason::MalformedRecord("missing question".into()))?;

    let token_ids = rec
        .clob_token_ids
        .ok_or_else(|| RejectionReason::MalformedRecord("missing clobTokenIds".into()))?;
    let labels = rec
        .outcomes
        .unwrap_or_else(|| DEFAULT_OUTCOMES.iter().map(|s| s.to_string()).collect());

    if token_ids.len() != 2 || labels.len() != 2 {
        return Err(RejectionReason::UnsupportedMarketShape(format!(
            "expected 2 outcomes, got {} tokens / {} labels",
            token_ids.len(),
            labels.len()
        )));
    }

    if rec.closed == Some(true) {
        return Err(RejectionReason::Closed);
    }
    if rec.active == Some(false) {
        return Err(RejectionReason::Inactive);
    }

    let extracted = extract_threshold(&title);

    let direction = match rec.direction.as_deref() {
        Some(d) => parse_direction(d)
            .ok_or_else(|| RejectionReason::MalformedRecord(format!("unknown direction {d:?}")))?,
        None => extracted.as_ref().map(|t| t.direction).unwrap_or(ThresholdDirection::Above),
    };

    let strike = rec
        .strike
        .or_else(|| extracted.as_ref().map(|t| t.strike))
        .ok_or_else(|| RejectionReason::UnsupportedMarketShape("no strike in title".into()))?;

    let underlying = rec
        .underlying
        .or_else(|| extract_underlying(&title, extracted.as_ref().map(|t| t.comparator_at)))
        .ok_or_else(|| RejectionReason::UnsupportedMarketShape("no underlying in title".into()))?;

    let expiry = match (rec.expiry, rec.end_date) {
        (Some(e), _) => parse_date(&e)?,
        (None, Some(end)) => parse_date(&end)?,
        (None, None) => extract_iso_date(&title)
            .ok_or_else(|| RejectionReason::UnsupportedMarketShape("no expiry date".into()))?,
    };

    let outcome_tokens: [OutcomeToken; 2] = token_ids
        .into_iter()
        .zip(labels)
        .map(|(token_id, label)| OutcomeToken { label, token_id })
        .collect::<Vec<_>>()
        .try_into()
        .map_err(|_| RejectionReason::UnsupportedMarketShape("expected 2 outcomes".into()))?;

    ThresholdBinaryMarket::new(
        MarketTerms {
            id: rec.id,
            title,
            underlying,
            strike,
            direction,
            expiry,
            outcome_tokens,
            event_title: rec.event_title,
            event_id: rec.event_id,
        },
        as_of,
    )
}

/// Interpret a price response for a binary market.
pub fn interpret_quote(raw: &RawQuote) -> Result<Quote, SourceError> {
    // /markets?id= answers with either a list or a single object.
    let value = match &raw.0 {
        serde_json::Value::Array(items) => items
            .first()
            .cloned()
            .ok_or_else(|| SourceError::MalformedQuote("empty quote response".into()))?,
        other => other.clone(),
    };

    let q: GammaQuote =
        serde_json::from_value(value).map_err(|e| SourceError::MalformedQuote(e.to_string()))?;

    let prices = q
        .outcome_prices
        .ok_or_else(|| SourceError::MalformedQuote("missing outcomePrices".into()))?;
    let prices: [Decimal; 2] = prices
        .try_into()
        .map_err(|v: Vec<Decimal>| SourceError::MalformedQuote(format!("expected 2 prices, got {}", v.len())))?;

    if let Some(p) = prices.iter().find(|p| **p < Decimal::ZERO || **p > Decimal::ONE) {
        return Err(SourceError::MalformedQuote(format!("price {p} outside [0, 1]")));
    }
    let sum = prices[0] + prices[1];
    if (sum - Decimal::ONE).abs() > PRICE_SUM_TOLERANCE {
        return Err(SourceError::MalformedQuote(format!("prices sum to {sum}")));
    }

    Ok(Quote {
        prices,
        best_bid: q.best_bid,
        best_ask: q.best_ask,
    })
}

/// Interpret a `/prices-history` response (`{"history": [{"t": secs, "p": price}]}`)
/// into points ordered by time. A missing or null `history` is an empty range.
pub fn interpret_history(raw: &RawHistory) -> Result<Vec<HistoryPoint>, SourceError> {
    let h: GammaHistory = serde_json::from_value(raw.0.clone())
        .map_err(|e| SourceError::MalformedQuote(format!("history: {e}")))?;

    let mut points = h
        .history
        .unwrap_or_default()
        .into_iter()
        .map(|p| {
            let at = DateTime::<Utc>::from_timestamp(p.t, 0)
                .ok_or_else(|| SourceError::MalformedQuote(format!("history timestamp {} out of range", p.t)))?;
            let price = p
                .p
                .to_decimal()
                .ok_or_else(|| SourceError::MalformedQuote("history price is not a number".into()))?;
            if price < Decimal::ZERO || price > Decimal::ONE {
                return Err(SourceError::MalformedQuote(format!("history price {price} outside [0, 1]")));
            }
            Ok(HistoryPoint { at, price })
        })
        .collect::<Result<Vec<_>, _>>()?;

    points.sort_by_key(|p| p.at);
    Ok(points)
}

#[derive(Debug, Clone, PartialEq)]
struct ExtractedThreshold {
    strike: Decimal,
    direction: ThresholdDirection,
    comparator_at: usize,
}

fn strike_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?P<cmp>>=|<=|>|<|\babove\b|\bbelow\b|\bover\b|\bunder\b|\bgreater than\b|\bless than\b|\bat least\b|\bat most\b|\breach(?:es)?\b|\bhits?\b|\bdips? to\b)\s*(?:\$\s*)?(?P<num>\d[\d,]*(?:\.\d+)?)(?P<suffix>[kmb])?\b",
        )
        .expect("valid strike pattern")
    })
}

fn alias_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let alts: Vec<String> = ASSET_ALIASES.iter().map(|(a, _)| regex::escape(a)).collect();
        Regex::new(&format!(r"(?i)\b({})\b", alts.join("|"))).expect("valid alias pattern")
    })
}

fn ticker_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Z][A-Z0-9]{1,9}\b").expect("valid ticker pattern"))
}

fn iso_date_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").expect("valid date pattern"))
}

fn extract_threshold(title: &str) -> Option<ExtractedThreshold> {
    let caps = strike_pattern().captures(title)?;
    let cmp = caps.name("cmp")?;
    let direction = parse_direction(cmp.as_str())?;

    let digits: String = caps["num"].chars().filter(|c| *c != ',').collect();
    let factor = match caps.name("suffix").map(|s| s.as_str().to_ascii_lowercase()).as_deref() {
        Some("k") => dec!(1000),
        Some("m") => dec!(1000000),
        Some("b") => dec!(1000000000),
        _ => Decimal::ONE,
    };
    // Out-of-range strikes fall through to "no strike in title".
    let strike = Decimal::from_str(&digits).ok()?.checked_mul(factor)?;

    Some(ExtractedThreshold {
        strike: strike.normalize(),
        direction,
        comparator_at: cmp.start(),
    })
}

fn parse_direction(s: &str) -> Option<ThresholdDirection> {
    match s.trim().to_ascii_lowercase().as_str() {
        ">" | ">=" | "above" | "over" | "greater than" | "at least" | "reach" | "reaches" | "hit"
        | "hits" => Some(ThresholdDirection::Above),
        "<" | "<=" | "below" | "under" | "less than" | "at most" | "dip to" | "dips to" => {
            Some(ThresholdDirection::Below)
        }
        _ => None,
    }
}

/// The alias or upper-case ticker closest before the comparator; failing
/// that, the first known alias anywhere in the title.
fn extract_underlying(title: &str, comparator_at: Option<usize>) -> Option<String> {
    if let Some(at) = comparator_at {
        let prefix = &title[..at];
        let alias = alias_pattern().find_iter(prefix).last();
        let ticker = ticker_pattern().find_iter(prefix).last();
        let nearest = match (alias, ticker) {
            (Some(a), Some(t)) if t.start() > a.start() => Some(t.as_str().to_string()),
            (Some(a), _) => alias_ticker(a.as_str()),
            (None, Some(t)) => Some(t.as_str().to_string()),
            (None, None) => None,
        };
        if nearest.is_some() {
            return nearest;
        }
    }

    alias_pattern().find(title).and_then(|m| alias_ticker(m.as_str()))
}

fn alias_ticker(found: &str) -> Option<String> {
    let found = found.to_ascii_lowercase();
    ASSET_ALIASES
        .iter()
        .find(|(alias, _)| *alias == found)
        .map(|(_, ticker)| ticker.to_string())
}

fn extract_iso_date(title: &str) -> Option<NaiveDate> {
    let m = iso_date_pattern().find(title)?;
    NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d").ok()
}

fn parse_date(s: &str) -> Result<NaiveDate, RejectionReason> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc).date_naive());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| RejectionReason::MalformedRecord(format!("unparseable date {s:?}")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaRecord {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, deserialize_with = "opt_encoded_list")]
    clob_token_ids: Option<Vec<String>>,
    #[serde(default, deserialize_with = "opt_encoded_list")]
    outcomes: Option<Vec<String>>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    closed: Option<bool>,
    #[serde(default)]
    event_title: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    event_id: Option<String>,

    // Structured terms; win over whatever the title says.
    #[serde(default)]
    underlying: Option<String>,
    #[serde(default, deserialize_with = "opt_decimal")]
    strike: Option<Decimal>,
    #[serde(default)]
    expiry: Option<String>,
    #[serde(default)]
    direction: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaQuote {
    #[serde(default, deserialize_with = "opt_encoded_decimals")]
    outcome_prices: Option<Vec<Decimal>>,
    #[serde(default, deserialize_with = "opt_decimal")]
    best_bid: Option<Decimal>,
    #[serde(default, deserialize_with = "opt_decimal")]
    best_ask: Option<Decimal>,
}

#[derive(Deserialize)]
struct GammaHistory {
    #[serde(default)]
    history: Option<Vec<GammaHistoryPoint>>,
}

#[derive(Deserialize)]
struct GammaHistoryPoint {
    t: i64,
    p: StringOrNumber,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Str(String),
    Num(serde_json::Number),
}

impl StringOrNumber {
    fn to_decimal(&self) -> Option<Decimal> {
        match self {
            StringOrNumber::Str(s) => Decimal::from_str(s.trim()).ok(),
            // Go through the textual form so 0.51 stays 0.51 rather than its f64 expansion.
            StringOrNumber::Num(n) => {
                let s = n.to_string();
                Decimal::from_str(&s).or_else(|_| Decimal::from_scientific(&s)).ok()
            }
        }
    }
}

/// Gamma encodes list fields as JSON inside a string (`"[\"a\", \"b\"]"`), but
/// a plain array is accepted too.
#[derive(Deserialize)]
#[serde(untagged)]
enum EncodedList<T> {
    List(Vec<T>),
    Encoded(String),
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::Str(s) => Ok(s),
        StringOrNumber::Num(n) => Ok(n.to_string()),
    }
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<StringOrNumber>::deserialize(deserializer)? {
        None => None,
        Some(StringOrNumber::Str(s)) => Some(s),
        Some(StringOrNumber::Num(n)) => Some(n.to_string()),
    })
}

fn opt_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<StringOrNumber>::deserialize(deserializer)? {
        None => Ok(None),
        Some(StringOrNumber::Str(s)) if s.trim().is_empty() => Ok(None),
        Some(v) => v
            .to_decimal()
            .map(Some)
            .ok_or_else(|| de::Error::custom("expected a finite number")),
    }
}

fn opt_encoded_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<EncodedList<String>>::deserialize(deserializer)? {
        None => Ok(None),
        Some(EncodedList::List(v)) => Ok(Some(v)),
        Some(EncodedList::Encoded(s)) => serde_json::from_str(&s).map(Some).map_err(de::Error::custom),
    }
}

fn opt_encoded_decimals<'de, D>(deserializer: D) -> Result<Option<Vec<Decimal>>, D::Error>
where
    D: Deserializer<'de>,
{
    let items: Vec<StringOrNumber> = match Option::<EncodedList<StringOrNumber>>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(EncodedList::List(v)) => v,
        Some(EncodedList::Encoded(s)) => serde_json::from_str(&s).map_err(de::Error::custom)?,
    };
    items
        .iter()
        .map(|v| v.to_decimal().ok_or_else(|| de::Error::custom("expected a finite price")))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}
