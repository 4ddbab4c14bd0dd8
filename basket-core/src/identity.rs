//! Product identity rules.
//!
//! Two scrapes of the same product must land on the same key. The URL wins
//! when present: scheme, host and path with the query string and fragment
//! stripped. Without a URL the key falls back to `site:normalized name`.

use url::Url;

/// Length ratio two names must reach for a containment match.
pub const NAME_MATCH_RATIO: f64 = 0.8;

/// Canonical form of a product URL, or `None` when the input is not an
/// absolute http(s) URL.
pub fn canonical_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let parsed = Url::parse(trimmed).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?;
    let path = parsed.path().trim_end_matches('/');

    Some(format!("{}://{}{}", parsed.scheme(), host, path))
}

/// Lowercase, trim and collapse internal whitespace.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Identity key for a product on `site`.
pub fn identity_key(site: &str, name: &str, url: &str) -> String {
    canonical_url(url)
        .unwrap_or_else(|| format!("{}:{}", site.trim().to_lowercase(), normalize_name(name)))
}

/// True when the key was derived from a URL rather than from the name.
pub fn is_url_identity(key: &str) -> bool {
    key.starts_with("https://") || key.starts_with("http://")
}

/// Fuzzy name comparison used when URL identity is unavailable.
///
/// Names match when their normalized forms are equal, or when one contains
/// the other and the shorter is at least [`NAME_MATCH_RATIO`] of the longer.
pub fn names_match(a: &str, b: &str) -> bool {
    names_match_with_ratio(a, b, NAME_MATCH_RATIO)
}

/// [`names_match`] with an explicit length ratio.
pub fn names_match_with_ratio(a: &str, b: &str, ratio: f64) -> bool {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a == b {
        return true;
    }
    if a.is_empty() || b.is_empty() {
        return false;
    }

    let (short, long) = if a.chars().count() <= b.chars().count() {
        (&a, &b)
    } else {
        (&b, &a)
    };
    if !long.contains(short.as_str()) {
        return false;
    }

    let short_len = short.chars().count() as f64;
    let long_len = long.chars().count() as f64;
    short_len / long_len >= ratio
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_canonical_url_strips_query_and_fragment() {
        assert_eq!(
            canonical_url("https://www.noon.com/p/123?utm=x#reviews").as_deref(),
            Some("https://www.noon.com/p/123")
        );
    }

    #[test]
    fn test_canonical_url_lowercases_host_and_trims_slash() {
        assert_eq!(
            canonical_url("  HTTPS://Amazon.SA/dp/B0C/  ").as_deref(),
            Some("https://amazon.sa/dp/B0C")
        );
    }

    #[test]
    fn test_canonical_url_rejects_relative_and_other_schemes() {
        assert_eq!(canonical_url(""), None);
        assert_eq!(canonical_url("/dp/B0C"), None);
        assert_eq!(canonical_url("ftp://example.com/a"), None);
    }

    #[test]
    fn test_identity_key_falls_back_to_site_and_name() {
        assert_eq!(identity_key("Noon.com", "Galaxy  S24", ""), "noon.com:galaxy s24");
        assert!(!is_url_identity("noon.com:galaxy s24"));
        assert!(is_url_identity(&identity_key("noon.com", "x", "https://noon.com/x")));
    }

    #[test]
    fn test_names_match_containment_respects_ratio() {
        assert!(names_match("Galaxy S24 Ultra", "galaxy s24 ultra"));
        // 15 of 16 chars
        assert!(names_match("galaxy s24 ultr", "galaxy s24 ultra"));
        assert!(!names_match("galaxy", "galaxy s24 ultra"));
        assert!(!names_match("", "galaxy"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_identity_key_ignores_query_string(
            path in "[a-z0-9]{1,12}",
            query in "[a-z0-9=&]{0,12}",
        ) {
            let bare = format!("https://shop.example/{path}");
            let noisy = format!("{bare}?{query}#frag");
            prop_assert_eq!(
                identity_key("shop.example", "x", &bare),
                identity_key("shop.example", "y", &noisy)
            );
        }

        #[test]
        fn prop_names_match_is_symmetric(a in "[a-z ]{0,20}", b in "[a-z ]{0,20}") {
            prop_assert_eq!(names_match(&a, &b), names_match(&b, &a));
        }

        #[test]
        fn prop_normalize_name_is_idempotent(name in "[A-Za-z \t]{0,30}") {
            let once = normalize_name(&name);
            prop_assert_eq!(normalize_name(&once), once);
        }
    }
}
