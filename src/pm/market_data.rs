use std::time::Duration;

use serde::de::Deserializer;
use serde::Deserialize;

use crate::error::SourceError;
use crate::types::{HistoryWindow, RawHistory, RawQuote, RawRecord};

pub const GAMMA_HOST: &str = "https://gamma-api.polymarket.com";
pub const CLOB_HOST: &str = "https://clob.polymarket.com";

/// Where market listings come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingMode {
    /// `/public-search?q=..`, flattening events into their markets.
    Search { query: String, limit_per_type: usize },
    /// `/markets?active=true&closed=false`, paged with limit/offset.
    Active { page_size: usize },
}

#[derive(Clone)]
pub struct GammaMarkets {
    host: String,
    http: reqwest::Client,
    mode: ListingMode,
    max_markets: usize,
}

impl GammaMarkets {
    pub fn new(host: String, mode: ListingMode, max_markets: usize, timeout: Duration) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            host,
            http,
            mode,
            max_markets: max_markets.max(1),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.host.trim_end_matches('/'), path)
    }

    pub async fn list_markets(&self) -> Result<Vec<RawRecord>, SourceError> {
        match &self.mode {
            ListingMode::Search { query, limit_per_type } => {
                self.search_markets(query, *limit_per_type).await
            }
            ListingMode::Active { page_size } => self.page_active_markets(*page_size).await,
        }
    }

    async fn search_markets(&self, query: &str, limit_per_type: usize) -> Result<Vec<RawRecord>, SourceError> {
        let limit = limit_per_type.to_string();
        let resp: SearchResp = self
            .http
            .get(self.url("/public-search"))
            .query(&[
                ("q", query),
                ("limit_per_type", limit.as_str()),
                ("search_tags", "false"),
                ("search_profiles", "false"),
                // optimized responses drop clobTokenIds
                ("optimized", "false"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut out: Vec<RawRecord> = vec![];
        for ev in resp.events {
            for mut m in ev.markets {
                if let Some(obj) = m.as_object_mut() {
                    if let Some(ref t) = ev.title {
                        obj.insert("eventTitle".into(), serde_json::Value::String(t.clone()));
                    }
                    if let Some(ref id) = ev.id {
                        obj.insert("eventId".into(), id.clone());
                    }
                }
                out.push(RawRecord(m));
                if out.len() >= self.max_markets {
                    return Ok(out);
                }
            }
        }

        tracing::debug!(query = %query, records = out.len(), "public-search flattened");
        Ok(out)
    }

    async fn page_active_markets(&self, page_size: usize) -> Result<Vec<RawRecord>, SourceError> {
        let page_size = page_size.max(1);
        let mut out: Vec<RawRecord> = vec![];
        let mut offset: usize = 0;

        loop {
            let limit = page_size.to_string();
            let off = offset.to_string();
            let page: Vec<serde_json::Value> = self
                .http
                .get(self.url("/markets"))
                .query(&[
                    ("active", "true"),
                    ("closed", "false"),
                    ("limit", limit.as_str()),
                    ("offset", off.as_str()),
                ])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            let n = page.len();
            for m in page {
                out.push(RawRecord(m));
                if out.len() >= self.max_markets {
                    return Ok(out);
                }
            }

            tracing::debug!(offset, page = n, total = out.len(), "markets page fetched");
            if n < page_size {
                break;
            }
            offset += n;
        }

        Ok(out)
    }

    pub async fn fetch_market(&self, market_id: &str) -> Result<RawQuote, SourceError> {
        let body: serde_json::Value = self
            .http
            .get(self.url("/markets"))
            .query(&[("id", market_id)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(RawQuote(body))
    }
}

/// CLOB price history per outcome token.
#[derive(Clone)]
pub struct ClobHistory {
    host: String,
    http: reqwest::Client,
}

impl ClobHistory {
    pub fn new(host: String, timeout: Duration) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { host, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.host.trim_end_matches('/'), path)
    }

    pub async fn prices_history(&self, token_id: &str, window: &HistoryWindow) -> Result<RawHistory, SourceError> {
        let start = window.start.timestamp().to_string();
        let end = window.end.timestamp().to_string();
        let fidelity = window.fidelity_minutes.to_string();
        let body: serde_json::Value = self
            .http
            .get(self.url("/prices-history"))
            .query(&[
                ("market", token_id),
                ("startTs", start.as_str()),
                ("endTs", end.as_str()),
                ("fidelity", fidelity.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(RawHistory(body))
    }
}

fn vec_or_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let opt = Option::<Vec<T>>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

#[derive(Debug, Clone, Deserialize)]
struct SearchResp {
    #[serde(default, deserialize_with = "vec_or_empty")]
    events: Vec<SearchEvent>,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchEvent {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, deserialize_with = "vec_or_empty")]
    markets: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_search_resp_tolerates_nulls() {
        let resp: SearchResp = serde_json::from_value(json!({
            "events": [
                { "id": "1", "title": "Bitcoin above ___ on June 30?", "markets": null },
                { "id": 2, "markets": [{ "id": "9" }] }
            ],
            "tags": null
        }))
        .unwrap();
        assert_eq!(resp.events.len(), 2);
        assert!(resp.events[0].markets.is_empty());
        assert_eq!(resp.events[1].markets.len(), 1);

        let empty: SearchResp = serde_json::from_value(json!({ "events": null })).unwrap();
        assert!(empty.events.is_empty());
    }

    #[test]
    fn test_url_joins_host() {
        let g = GammaMarkets::new(
            "https://example.test/".into(),
            ListingMode::Active { page_size: 100 },
            10,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(g.url("/markets"), "https://example.test/markets");

        let c = ClobHistory::new(CLOB_HOST.into(), Duration::from_secs(1)).unwrap();
        assert_eq!(c.url("/prices-history"), "https://clob.polymarket.com/prices-history");
    }
}
