//! Namespaced cache keys.
//!
//! Keys can only be built through the namespace constructors, so every key
//! in a backend carries a known prefix and queries are normalized the same
//! way on the read and write paths.

use basket_core::normalize_name;
use std::fmt;

/// Separator between namespace and id in the encoded form.
const SEPARATOR: char = ':';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheNamespace {
    /// Aggregated results for a search query.
    Search,
    /// A single product by identity key.
    Product,
}

impl CacheNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheNamespace::Search => "search",
            CacheNamespace::Product => "product",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "search" => Some(CacheNamespace::Search),
            "product" => Some(CacheNamespace::Product),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: CacheNamespace,
    id: String,
}

impl CacheKey {
    /// Key for a search query. `"iPhone  15"` and `"iphone 15"` share a key.
    pub fn search(query: &str) -> Self {
        Self {
            namespace: CacheNamespace::Search,
            id: normalize_name(query),
        }
    }

    pub fn product(identity_key: &str) -> Self {
        Self {
            namespace: CacheNamespace::Product,
            id: identity_key.to_string(),
        }
    }

    pub fn namespace(&self) -> CacheNamespace {
        self.namespace
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn encode(&self) -> String {
        format!("{}{}{}", self.namespace.as_str(), SEPARATOR, self.id)
    }

    /// Inverse of [`CacheKey::encode`].
    pub fn decode(encoded: &str) -> Option<Self> {
        let (namespace, id) = encoded.split_once(SEPARATOR)?;
        Some(Self {
            namespace: CacheNamespace::parse(namespace)?,
            id: id.to_string(),
        })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.namespace.as_str(), SEPARATOR, self.id)
    }
}
