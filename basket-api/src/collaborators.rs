//! External collaborators.
//!
//! Scraping, persistence and record validation live outside this
//! workspace. The refresh pipeline only sees them through these traits.

use std::sync::Arc;

use async_trait::async_trait;
use basket_core::{FetchError, ProductRecord, StorageError, ValidationError};

use crate::validation::ShapeValidator;

/// Produces candidate records for a query from one external source.
#[async_trait]
pub trait ScrapeCollaborator: Send + Sync {
    /// Source name used for rate limiting and as the record `site`.
    fn source(&self) -> &str;

    async fn search(&self, query: &str) -> Result<Vec<ProductRecord>, FetchError>;
}

/// Durable record store, keyed by `identity_key`. Upserts are idempotent.
#[async_trait]
pub trait PersistenceCollaborator: Send + Sync {
    async fn upsert(&self, records: &[ProductRecord]) -> Result<(), StorageError>;
}

/// Splits a batch into structurally valid and invalid records.
pub trait ValidationCollaborator: Send + Sync {
    fn validate(&self, records: Vec<ProductRecord>) -> ValidationReport;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub valid: Vec<ProductRecord>,
    pub invalid: Vec<(ProductRecord, ValidationError)>,
}

/// Persistence that stores nothing. For deployments where the cache is
/// the only store.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardPersistence;

#[async_trait]
impl PersistenceCollaborator for DiscardPersistence {
    async fn upsert(&self, _records: &[ProductRecord]) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Everything the refresh pipeline talks to outside the process.
#[derive(Clone)]
pub struct Collaborators {
    pub scrapers: Vec<Arc<dyn ScrapeCollaborator>>,
    pub persistence: Arc<dyn PersistenceCollaborator>,
    pub validator: Arc<dyn ValidationCollaborator>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("sources", &self.source_names())
            .finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Scrapers plus persistence, validated with [`ShapeValidator`].
    pub fn new(
        scrapers: Vec<Arc<dyn ScrapeCollaborator>>,
        persistence: Arc<dyn PersistenceCollaborator>,
    ) -> Self {
        Self {
            scrapers,
            persistence,
            validator: Arc::new(ShapeValidator),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn ValidationCollaborator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn scraper(&self, source: &str) -> Option<&Arc<dyn ScrapeCollaborator>> {
        self.scrapers.iter().find(|s| s.source() == source)
    }

    pub fn source_names(&self) -> Vec<String> {
        self.scrapers.iter().map(|s| s.source().to_string()).collect()
    }
}
