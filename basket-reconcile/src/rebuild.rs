//! Deciding whether a merge warrants pushing a new result set to clients.

use std::fmt;

use basket_core::{ProductRecord, ReconcileConfig};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::matching::match_records;
use crate::merge::merged_price;

/// Which check triggered (or none did).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RebuildReason {
    NewItems { count: usize },
    PriceChanges { count: usize },
    Removals { count: usize, cached: usize },
    NoSignificantChanges,
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildReason::NewItems { count } => write!(f, "{count} new items found"),
            RebuildReason::PriceChanges { count } => {
                write!(f, "price changes detected for {count} items")
            }
            RebuildReason::Removals { count, cached } => {
                write!(f, "{count} of {cached} items removed")
            }
            RebuildReason::NoSignificantChanges => f.write_str("no significant changes"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildDecision {
    pub should_rebuild: bool,
    pub reason: String,
    pub trigger: RebuildReason,
}

impl RebuildDecision {
    fn from_reason(trigger: RebuildReason) -> Self {
        Self {
            should_rebuild: trigger != RebuildReason::NoSignificantChanges,
            reason: trigger.to_string(),
            trigger,
        }
    }
}

/// Decide whether merging `fresh` into `cached` changes the result set
/// enough to rebuild client views.
///
/// Checks run in order and the first to match supplies the reason:
/// 1. at least `min_new_items_threshold` fresh records have no cached counterpart
/// 2. with `require_price_changes`, a merged price moved more than
///    `price_change_ratio` from the cached one, or the cached price was unknown
/// 3. unseen live records make up at least `removal_rebuild_ratio` of the live cached set
pub fn should_rebuild(
    cached: &[ProductRecord],
    fresh: &[ProductRecord],
    config: &ReconcileConfig,
) -> RebuildDecision {
    let matching = match_records(cached, fresh);

    let new_items = matching.new_count();
    if new_items >= config.min_new_items_threshold {
        return RebuildDecision::from_reason(RebuildReason::NewItems { count: new_items });
    }

    if config.require_price_changes {
        let threshold = Decimal::from_f64_retain(config.price_change_ratio).unwrap_or(Decimal::ZERO);
        let changed = matching
            .matched()
            .filter(|(fi, ci)| {
                let before = &cached[*ci];
                let after = merged_price(before, &fresh[*fi], config);
                price_changed(before.known_price(), after.filter(|p| !p.is_zero()), threshold)
            })
            .count();
        if changed > 0 {
            return RebuildDecision::from_reason(RebuildReason::PriceChanges { count: changed });
        }
    }

    let live_cached = cached.iter().filter(|r| !r.removed).count();
    let removed = matching
        .unmatched
        .iter()
        .filter(|ci| !cached[**ci].removed)
        .count();
    if removed > 0 && removed as f64 >= config.removal_rebuild_ratio * live_cached as f64 {
        return RebuildDecision::from_reason(RebuildReason::Removals {
            count: removed,
            cached: live_cached,
        });
    }

    RebuildDecision::from_reason(RebuildReason::NoSignificantChanges)
}

fn price_changed(before: Option<Decimal>, after: Option<Decimal>, threshold: Decimal) -> bool {
    match (before, after) {
        (Some(before), Some(after)) => (after - before).abs() > before.abs() * threshold,
        (None, None) => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn priced(path: &str, price: i64) -> ProductRecord {
        ProductRecord::new(
            "noon.com",
            path,
            format!("https://noon.com/{path}"),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        )
        .with_price(Decimal::from(price))
    }

    #[test]
    fn test_new_item_triggers_rebuild() {
        let cached = vec![priced("a", 100)];
        let fresh = vec![priced("a", 90), priced("b", 50)];
        let decision = should_rebuild(&cached, &fresh, &ReconcileConfig::default());
        assert!(decision.should_rebuild);
        assert_eq!(decision.trigger, RebuildReason::NewItems { count: 1 });
        assert_eq!(decision.reason, "1 new items found");
    }

    #[test]
    fn test_small_price_move_is_not_a_change() {
        let cached = vec![priced("a", 100)];
        let fresh = vec![priced("a", 104)];
        let decision = should_rebuild(&cached, &fresh, &ReconcileConfig::default());
        assert!(!decision.should_rebuild);
        assert_eq!(decision.reason, "no significant changes");
    }

    #[test]
    fn test_price_move_above_five_percent() {
        let cached = vec![priced("a", 100)];
        let fresh = vec![priced("a", 106)];
        let decision = should_rebuild(&cached, &fresh, &ReconcileConfig::default());
        assert_eq!(decision.trigger, RebuildReason::PriceChanges { count: 1 });

        let relaxed = ReconcileConfig::default().with_require_price_changes(false);
        assert!(!should_rebuild(&cached, &fresh, &relaxed).should_rebuild);
    }

    #[test]
    fn test_previously_unknown_price_is_a_change() {
        let cached = vec![ProductRecord::new(
            "noon.com",
            "a",
            "https://noon.com/a",
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        )];
        let fresh = vec![priced("a", 10)];
        assert!(should_rebuild(&cached, &fresh, &ReconcileConfig::default()).should_rebuild);
    }

    #[test]
    fn test_removals_at_ten_percent() {
        let cached: Vec<_> = (0..10).map(|i| priced(&format!("p{i}"), 10)).collect();
        let fresh: Vec<_> = cached[..9].to_vec();
        let decision = should_rebuild(&cached, &fresh, &ReconcileConfig::default());
        assert_eq!(decision.trigger, RebuildReason::Removals { count: 1, cached: 10 });
    }

    #[test]
    fn test_identical_scrape_does_not_rebuild() {
        let cached = vec![priced("a", 10), priced("b", 20)];
        let decision = should_rebuild(&cached, &cached, &ReconcileConfig::default());
        assert!(!decision.should_rebuild);
    }
}
