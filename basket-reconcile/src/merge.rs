//! Merging a fresh scrape into the cached set.

use basket_core::{is_url_identity, ProductRecord, ReconcileConfig, Timestamp};
use serde::Serialize;

use crate::matching::match_records;
use crate::sort::sort_by_price;

/// Counts describing what a merge did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    /// Fresh records with no cached counterpart.
    pub new: usize,
    /// Fresh records merged onto a cached counterpart.
    pub updated: usize,
    /// Cached records not seen in the scrape and dropped.
    pub removed: usize,
    /// Cached records not seen in the scrape and kept tagged `removed`.
    pub retained_removed: usize,
    /// Cached records kept untouched because the removal share tripped
    /// the anomaly ceiling.
    pub kept_by_guard: usize,
    pub anomaly: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub records: Vec<ProductRecord>,
    pub outcome: ReconcileOutcome,
}

/// Merge `fresh` into `cached` and return the new record set, ordered by
/// ascending price.
pub fn merge(
    cached: &[ProductRecord],
    fresh: &[ProductRecord],
    config: &ReconcileConfig,
    now: Timestamp,
) -> Vec<ProductRecord> {
    reconcile(cached, fresh, config, now).records
}

/// [`merge`] plus a summary of what changed.
///
/// Unseen cached records are dropped, or tagged `removed` when
/// `keep_removed` is set. If the share of live cached records that went
/// unseen exceeds `max_removal_ratio`, the scrape is treated as anomalous
/// and every unseen record is carried over unchanged.
pub fn reconcile(
    cached: &[ProductRecord],
    fresh: &[ProductRecord],
    config: &ReconcileConfig,
    now: Timestamp,
) -> Reconciliation {
    let matching = match_records(cached, fresh);
    let mut outcome = ReconcileOutcome::default();
    let mut records = Vec::with_capacity(matching.pairs.len() + matching.unmatched.len());

    for (fi, counterpart) in &matching.pairs {
        let incoming = &fresh[*fi];
        match counterpart {
            Some(ci) => {
                outcome.updated += 1;
                records.push(overlay(&cached[*ci], incoming, config, now));
            }
            None => {
                outcome.new += 1;
                let mut record = incoming.clone();
                record.first_seen_at = now;
                record.last_seen_at = now;
                record.removed = false;
                records.push(record);
            }
        }
    }

    let live_cached = cached.iter().filter(|r| !r.removed).count();
    let newly_unseen = matching
        .unmatched
        .iter()
        .filter(|ci| !cached[**ci].removed)
        .count();
    outcome.anomaly = newly_unseen > 0
        && live_cached > 0
        && newly_unseen as f64 / live_cached as f64 > config.max_removal_ratio;

    for ci in &matching.unmatched {
        let record = &cached[*ci];
        if outcome.anomaly {
            outcome.kept_by_guard += 1;
            records.push(record.clone());
        } else if config.keep_removed {
            outcome.retained_removed += 1;
            let mut tagged = record.clone();
            tagged.removed = true;
            records.push(tagged);
        } else {
            outcome.removed += 1;
        }
    }

    sort_by_price(&mut records);
    Reconciliation { records, outcome }
}

/// Price a merged record ends up with.
pub(crate) fn merged_price(
    cached: &ProductRecord,
    fresh: &ProductRecord,
    config: &ReconcileConfig,
) -> Option<rust_decimal::Decimal> {
    if config.prioritize_new_prices {
        fresh.known_price().or(cached.price)
    } else {
        cached.known_price().or(fresh.price)
    }
}

/// Cached fields with fresh fields laid over them.
fn overlay(
    cached: &ProductRecord,
    fresh: &ProductRecord,
    config: &ReconcileConfig,
    now: Timestamp,
) -> ProductRecord {
    // A fuzzy match keeps the cached identity, so the URL must stay with it.
    let url = if is_url_identity(&fresh.identity_key) {
        fresh.url.clone()
    } else {
        cached.url.clone()
    };
    let currency = if fresh.currency.is_empty() {
        cached.currency.clone()
    } else {
        fresh.currency.clone()
    };

    ProductRecord {
        identity_key: cached.identity_key.clone(),
        site: fresh.site.clone(),
        name: fresh.name.clone(),
        price: merged_price(cached, fresh, config),
        currency,
        url,
        image: fresh.image.clone().or_else(|| cached.image.clone()),
        first_seen_at: cached.first_seen_at,
        last_seen_at: now,
        removed: false,
    }
}
