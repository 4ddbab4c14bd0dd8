//! Pairing fresh records with their cached counterparts.

use std::collections::{HashMap, HashSet};

use basket_core::{is_url_identity, names_match, ProductRecord};

/// Result of pairing a fresh scrape with the cached set.
#[derive(Debug, Default)]
pub(crate) struct Matching {
    /// `(fresh index, cached counterpart)` in fresh order. Fresh records
    /// repeating an earlier identity key are left out.
    pub pairs: Vec<(usize, Option<usize>)>,
    /// Cached records no fresh record claimed, in cached order.
    pub unmatched: Vec<usize>,
}

impl Matching {
    pub fn new_count(&self) -> usize {
        self.pairs.iter().filter(|(_, c)| c.is_none()).count()
    }

    pub fn matched(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.pairs.iter().filter_map(|(f, c)| c.map(|c| (*f, c)))
    }
}

/// Pair records by identity key, then fall back to fuzzy name matching
/// within the same site for fresh records that have no URL identity.
///
/// Each cached record is claimed at most once. Exact matches are resolved
/// for the whole scrape before any fuzzy matching runs.
pub(crate) fn match_records(cached: &[ProductRecord], fresh: &[ProductRecord]) -> Matching {
    let mut by_key: HashMap<&str, usize> = HashMap::with_capacity(cached.len());
    for (i, record) in cached.iter().enumerate() {
        by_key.entry(record.identity_key.as_str()).or_insert(i);
    }

    let mut claimed = vec![false; cached.len()];
    let mut seen: HashSet<&str> = HashSet::with_capacity(fresh.len());
    let mut pairs = Vec::with_capacity(fresh.len());
    let mut pending = Vec::new();

    for (fi, record) in fresh.iter().enumerate() {
        if !seen.insert(record.identity_key.as_str()) {
            continue;
        }
        match by_key.get(record.identity_key.as_str()) {
            Some(&ci) if !claimed[ci] => {
                claimed[ci] = true;
                pairs.push((fi, Some(ci)));
            }
            _ => pending.push(fi),
        }
    }

    for fi in pending {
        let record = &fresh[fi];
        let counterpart = if is_url_identity(&record.identity_key) {
            None
        } else {
            cached
                .iter()
                .enumerate()
                .find(|(ci, c)| {
                    !claimed[*ci]
                        && c.site.eq_ignore_ascii_case(&record.site)
                        && names_match(&c.name, &record.name)
                })
                .map(|(ci, _)| ci)
        };
        if let Some(ci) = counterpart {
            claimed[ci] = true;
        }
        pairs.push((fi, counterpart));
    }
    pairs.sort_unstable_by_key(|(fi, _)| *fi);

    let unmatched = (0..cached.len()).filter(|i| !claimed[*i]).collect();
    Matching { pairs, unmatched }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(site: &str, name: &str, url: &str) -> ProductRecord {
        ProductRecord::new(site, name, url, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_exact_key_match() {
        let cached = vec![record("noon.com", "A", "https://noon.com/a")];
        let fresh = vec![record("noon.com", "A renamed", "https://noon.com/a?x=1")];
        let m = match_records(&cached, &fresh);
        assert_eq!(m.pairs, vec![(0, Some(0))]);
        assert!(m.unmatched.is_empty());
    }

    #[test]
    fn test_fuzzy_match_same_site_only() {
        let cached = vec![
            record("amazon.sa", "Galaxy S24 Ultra", ""),
            record("noon.com", "Galaxy S24 Ultra 256GB", ""),
        ];
        let fresh = vec![record("noon.com", "galaxy s24 ultra 256gb!", "")];
        let m = match_records(&cached, &fresh);
        assert_eq!(m.pairs, vec![(0, Some(1))]);
        assert_eq!(m.unmatched, vec![0]);
    }

    #[test]
    fn test_url_identity_never_fuzzy_matches() {
        let cached = vec![record("noon.com", "Kettle", "")];
        let fresh = vec![record("noon.com", "Kettle", "https://noon.com/kettle")];
        let m = match_records(&cached, &fresh);
        assert_eq!(m.new_count(), 1);
        assert_eq!(m.unmatched, vec![0]);
    }

    #[test]
    fn test_duplicate_fresh_keys_are_skipped() {
        let fresh = vec![
            record("noon.com", "A", "https://noon.com/a"),
            record("noon.com", "A again", "https://noon.com/a#dup"),
        ];
        let m = match_records(&[], &fresh);
        assert_eq!(m.pairs, vec![(0, None)]);
    }
}
