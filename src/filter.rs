use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::catalog::MarketCatalog;
use crate::types::ThresholdBinaryMarket;

/// Operator search criteria. Unset fields impose no constraint; set fields
/// are ANDed together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterCriteria {
    /// Case-insensitive substring of title or underlying.
    pub text_query: Option<String>,
    pub expiry_on: Option<NaiveDate>,
    /// Inclusive.
    pub min_strike: Option<Decimal>,
    /// Inclusive.
    pub max_strike: Option<Decimal>,
}

impl FilterCriteria {
    pub fn matches(&self, m: &ThresholdBinaryMarket) -> bool {
        if let Some(q) = self.text_query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            let q = q.to_lowercase();
            if !m.title().to_lowercase().contains(&q) && !m.underlying().to_lowercase().contains(&q) {
                return false;
            }
        }
        if self.expiry_on.is_some_and(|d| d != m.expiry()) {
            return false;
        }
        if self.min_strike.is_some_and(|min| m.strike() < min) {
            return false;
        }
        if self.max_strike.is_some_and(|max| m.strike() > max) {
            return false;
        }
        true
    }
}

/// Matching markets ordered by expiry, then title. Id breaks remaining ties
/// so the order never depends on catalog iteration order.
pub fn filter(catalog: &MarketCatalog, criteria: &FilterCriteria) -> Vec<ThresholdBinaryMarket> {
    let mut out: Vec<ThresholdBinaryMarket> = catalog
        .markets()
        .filter(|m| criteria.matches(m))
        .cloned()
        .collect();
    out.sort_by(|a, b| {
        a.expiry()
            .cmp(&b.expiry())
            .then_with(|| a.title().cmp(b.title()))
            .then_with(|| a.id().cmp(b.id()))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::{date, market};
    use rust_decimal_macros::dec;

    fn catalog() -> MarketCatalog {
        MarketCatalog::from_markets([
            market("m1", "BTC > $100k on 2025-12-31", "BTC", dec!(100000), date(2025, 12, 31)),
            market("m2", "ETH > $4k on 2025-07-01", "ETH", dec!(4000), date(2025, 7, 1)),
            market("m3", "BTC > $80k on 2025-07-01", "BTC", dec!(80000), date(2025, 7, 1)),
            market("m4", "Bitcoin above $120,000 on Dec 31", "BTC", dec!(120000), date(2025, 12, 31)),
        ])
    }

    fn ids(v: &[ThresholdBinaryMarket]) -> Vec<&str> {
        v.iter().map(|m| m.id()).collect()
    }

    #[test]
    fn test_text_and_min_strike() {
        let only_m1 = MarketCatalog::from_markets([market(
            "m1",
            "BTC > $100k on 2025-12-31",
            "BTC",
            dec!(100000),
            date(2025, 12, 31),
        )]);
        let q = FilterCriteria {
            text_query: Some("btc".into()),
            min_strike: Some(dec!(50000)),
            ..Default::default()
        };
        assert_eq!(ids(&filter(&only_m1, &q)), vec!["m1"]);

        let q = FilterCriteria {
            expiry_on: Some(date(2026, 1, 1)),
            ..Default::default()
        };
        assert!(filter(&only_m1, &q).is_empty());
    }

    #[test]
    fn test_unset_criteria_returns_everything_ordered() {
        let out = filter(&catalog(), &FilterCriteria::default());
        assert_eq!(ids(&out), vec!["m3", "m2", "m1", "m4"]);
    }

    #[test]
    fn test_text_query_matches_underlying_case_insensitive() {
        let q = FilterCriteria {
            text_query: Some("  Btc ".into()),
            ..Default::default()
        };
        // m4's title says Bitcoin, its underlying says BTC
        assert_eq!(ids(&filter(&catalog(), &q)), vec!["m3", "m1", "m4"]);
    }

    #[test]
    fn test_strike_bounds_are_inclusive() {
        let q = FilterCriteria {
            min_strike: Some(dec!(80000)),
            max_strike: Some(dec!(100000)),
            ..Default::default()
        };
        assert_eq!(ids(&filter(&catalog(), &q)), vec!["m3", "m1"]);
    }

    #[test]
    fn test_every_result_satisfies_all_criteria() {
        let q = FilterCriteria {
            text_query: Some("btc".into()),
            expiry_on: Some(date(2025, 12, 31)),
            min_strike: Some(dec!(110000)),
            max_strike: None,
        };
        let c = catalog();
        let out = filter(&c, &q);
        assert_eq!(ids(&out), vec!["m4"]);
        for m in &out {
            assert!(q.matches(m));
            assert!(c.contains(m.id()));
        }
    }

    #[test]
    fn test_order_independent_of_input_order() {
        let mut ms: Vec<_> = catalog().markets().cloned().collect();
        ms.sort_by(|a, b| b.id().cmp(a.id()));
        let reversed = MarketCatalog::from_markets(ms);
        assert_eq!(
            ids(&filter(&reversed, &FilterCriteria::default())),
            ids(&filter(&catalog(), &FilterCriteria::default()))
        );
    }
}
