//! BASKET API - Stale-While-Revalidate Product Search
//!
//! Ties the cache, reconciler, job orchestrator and notification bus into
//! one search pipeline. HTTP routing, authentication and the scrapers
//! themselves live outside; they plug in through [`collaborators`] and
//! call into [`BasketRuntime`].
//!
//! # Flow
//!
//! ```text
//! search(q) ─▶ FreshnessCache ─┬─ fresh ─▶ respond
//!                              ├─ stale ─▶ respond + enqueue refresh
//!                              └─ miss  ─▶ direct fetch (bounded) + enqueue refresh
//!
//! refresh job ─▶ scrape (rate limited, all-settled) ─▶ validate ─▶ merge
//!             ─▶ persist ─▶ cache.set ─▶ notify updateSearch
//! ```

pub mod collaborators;
pub mod config;
pub mod refresh;
pub mod runtime;
pub mod search;
pub mod telemetry;
pub mod validation;

pub use collaborators::{
    Collaborators, DiscardPersistence, PersistenceCollaborator, ScrapeCollaborator,
    ValidationCollaborator, ValidationReport,
};
pub use config::BasketConfig;
pub use refresh::{RefreshReport, RefreshSearchProcessor, RefreshSourceProcessor, Refresher, Scrape};
pub use runtime::BasketRuntime;
pub use search::{SearchResponse, SearchService};
pub use telemetry::{init_tracing, TelemetryConfig, TelemetryError};
pub use validation::ShapeValidator;
