use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::RwLock;

use crate::catalog::MarketCatalog;
use crate::error::SessionError;
use crate::types::ThresholdBinaryMarket;

/// Markets the operator is watching, keyed by id.
///
/// Each entry keeps the market terms it was subscribed with, so a market that
/// drops out of a later catalog is still polled with its last-known terms
/// until it is unsubscribed. Every mutation takes the write lock, so a tick
/// calling [`SubscriptionSet::snapshot`] sees membership either before or after it.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    members: RwLock<BTreeMap<String, ThresholdBinaryMarket>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `id` was newly added; subscribing twice is a no-op.
    pub async fn subscribe(&self, id: &str, catalog: &MarketCatalog) -> Result<bool, SessionError> {
        let market = catalog
            .get(id)
            .ok_or_else(|| SessionError::UnknownMarket(id.to_string()))?;

        let mut members = self.members.write().await;
        if members.contains_key(id) {
            return Ok(false);
        }
        members.insert(id.to_string(), market.clone());
        tracing::info!(market_id = %id, title = %market.title(), "subscribed");
        Ok(true)
    }

    /// Returns `true` if `id` was a member; removing an absent id is a no-op.
    pub async fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.members.write().await.remove(id).is_some();
        if removed {
            tracing::info!(market_id = %id, "unsubscribed");
        }
        removed
    }

    pub async fn members(&self) -> BTreeSet<String> {
        self.members.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }

    /// Point-in-time copy of the subscribed markets, in id order.
    pub async fn snapshot(&self) -> Vec<ThresholdBinaryMarket> {
        self.members.read().await.values().cloned().collect()
    }

    /// Adopt newer terms from `catalog` for members it still lists. Returns
    /// how many members it no longer lists; those keep their old terms.
    pub async fn rebase(&self, catalog: &MarketCatalog) -> usize {
        let mut members = self.members.write().await;
        let mut missing = 0;
        for (id, current) in members.iter_mut() {
            match catalog.get(id) {
                Some(fresh) if *fresh != *current => {
                    tracing::info!(market_id = %id, "subscription terms updated from catalog");
                    *current = fresh.clone();
                }
                Some(_) => {}
                None => {
                    tracing::warn!(market_id = %id, "subscribed market missing from catalog, keeping last-known terms");
                    missing += 1;
                }
            }
        }
        missing
    }
}
