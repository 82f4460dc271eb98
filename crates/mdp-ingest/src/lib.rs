//! MDP Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Ingestion and validation core for marine observation data: pulls
//! occurrence, sensor and profile records from external providers, validates
//! and normalizes them into canonical observations, deduplicates across
//! providers and streams the result to an output sink.
//!
//! # Supported Providers
//!
//! - **OBIS**: species occurrences, keyset pagination
//! - **GBIF**: species occurrences, offset pagination
//! - **NDBC**: buoy realtime text feeds, paged by station and row offset
//! - **Argovis**: Argo float profiles, paged by date window and profile offset
//!
//! ERDDAP servers are searched for datasets ([`source::ErddapCatalog`]) but
//! not ingested from.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mdp_ingest::{config::IngestConfig, source, JsonLinesSink, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::load(Some("config/ingest.toml".as_ref()))?;
//!     let adapters = source::build_adapters(&config)?;
//!     let sink = Arc::new(JsonLinesSink::create("./data/out".as_ref())?);
//!
//!     let orchestrator = Orchestrator::builder(config)
//!         .sources(adapters)
//!         .sink(sink)
//!         .build()?;
//!     let report = orchestrator.run().await?;
//!     println!("{:?}", report.outcome());
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod dedup;
pub mod error;
pub mod orchestrator;
pub mod resilience;
pub mod sink;
pub mod source;
pub mod stats;
pub mod taxonomy;
pub mod units;
pub mod validate;

pub use catalog::DataCatalog;
pub use dedup::{DedupOutcome, Deduplicator, ExistingKeyLookup, KeyIndex};
pub use error::{FetchError, FetchResult, IngestError, Result};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use sink::{JsonLinesSink, MemorySink, OutputSink};
pub use source::{Page, SourceAdapter};
pub use stats::{RunOutcome, RunReport, RunState, SourceReport, SourceStatus};
pub use taxonomy::{StaticTaxonomy, TaxonomyResolver};
pub use validate::{DepthBounds, RegionalDepthBounds, Validator, Verdict};
