//! Biblio Ingest Library
//!
//! Resumable ingestion of bibliographic records into SQLite with identity
//! resolution of affiliations, authors, journals and documents.
//!
//! # Pipeline
//!
//! - **fetch**: rate-limited, retrying access to a [`fetch::RecordSource`] (PubMed E-utilities)
//! - **mapping**: payload → [`mapping::MappedRecord`]
//! - **normalize**: free-text affiliations → canonical keys and structured fields
//! - **resolve**: create-or-reuse of canonical entities and citation edges
//! - **progress**: per-identifier checkpoints and search cursors
//! - **orchestrator**: seed → batch → process → checkpoint
//!
//! # Example
//!
//! ```no_run
//! use std::num::NonZeroU32;
//! use std::sync::Arc;
//!
//! use biblio_ingest::db::{connect, DbConfig};
//! use biblio_ingest::fetch::{EutilsConfig, EutilsSource, RateLimitedFetchClient, RetryPolicy};
//! use biblio_ingest::mapping::PubmedXmlMapper;
//! use biblio_ingest::orchestrator::{CrawlSeed, IngestionOrchestrator, OrchestratorConfig};
//! use biblio_ingest::resolve::ResolutionSettings;
//! use biblio_ingest::search::SearchQuery;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = connect(&DbConfig::default()).await?;
//!     let source = Arc::new(EutilsSource::new(EutilsConfig::default())?);
//!     let client = RateLimitedFetchClient::new(source, NonZeroU32::MIN.saturating_add(2), RetryPolicy::default());
//!
//!     let mut orchestrator = IngestionOrchestrator::new(
//!         pool,
//!         client,
//!         Arc::new(PubmedXmlMapper),
//!         ResolutionSettings::default(),
//!         OrchestratorConfig::default(),
//!     )?;
//!     orchestrator.seed(&CrawlSeed::Query(SearchQuery::keyword("CRISPR"))).await?;
//!     let stats = orchestrator.run().await?;
//!     println!("completed {}", stats.completed);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod fetch;
pub mod mapping;
pub mod normalize;
pub mod orchestrator;
pub mod progress;
pub mod resolve;
pub mod search;

pub use config::IngestConfig;
pub use error::{FailureKind, IngestError, IngestResult};
pub use events::{IngestEvent, RunStats};
pub use orchestrator::{CrawlSeed, IngestionOrchestrator, OrchestratorConfig};
pub use progress::{CrawlStatus, ProgressTracker};
pub use search::SearchQuery;
