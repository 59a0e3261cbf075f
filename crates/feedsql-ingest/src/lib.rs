//! feedsql ingestion library
//!
//! Reads an RSS or Atom feed and stores its items in SQL tables whose shape
//! is declared in a YAML configuration.
//!
//! # Architecture
//!
//! - **config**: YAML document with a `source` and a `schema` section
//! - **schema**: compiles field descriptors into table definitions and
//!   expression bindings, once, at startup
//! - **expr**: the closed expression language field values are written in
//! - **extract** / **row**: evaluate bindings against an item into a typed row
//! - **reference**: find-or-create of normalised values in reference tables
//! - **feed**: item model, HTTP transport and RSS/Atom parser
//! - **storage**: SQLite DDL and upserts
//! - **pipeline**: one fetch → parse → extract → write run
//! - **scheduler**: repeats runs at a fixed interval
//!
//! # Example
//!
//! ```no_run
//! use feedsql_ingest::{Config, IngestPipeline, SqlStorage, StorageConfig};
//!
//! # async fn example() -> feedsql_ingest::Result<()> {
//! let config = Config::load("news.yaml")?;
//! let storage = SqlStorage::connect(&StorageConfig::new("sqlite://news.db")).await?;
//! let pipeline = IngestPipeline::from_config(&config, storage).await?;
//! let stats = pipeline.run().await?;
//! println!("{} ingested, {} skipped", stats.ingested, stats.skipped);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod cli;
pub mod config;
pub mod error;
pub mod expr;
pub mod extract;
pub mod feed;
pub mod pipeline;
pub mod reference;
pub mod row;
pub mod scheduler;
pub mod schema;
pub mod storage;
pub mod value;

pub use cli::Cli;
pub use config::{Config, FieldDescriptor, SchemaConfig, SourceConfig, StorageConfig};
pub use error::{ExtractionError, IngestError, Result};
pub use expr::Expression;
pub use feed::{FeedItem, FeedParser, FeedTransport, HttpTransport, XmlFeedParser};
pub use pipeline::{IngestPipeline, RunStats};
pub use reference::ReferenceResolver;
pub use scheduler::{ScheduledJob, Scheduler};
pub use schema::{compile, compile_fields, CompiledSchema};
pub use storage::SqlStorage;
pub use value::Value;
