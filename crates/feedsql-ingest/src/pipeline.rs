//! Ingest pipeline
//!
//! One run is:
//!
//! 1. fetch the feed document (any failure aborts the run, nothing is written)
//! 2. parse it into items
//! 3. extraction phase: build one row per item, resolving reference values
//!    (reference rows are committed as they are created); an item whose
//!    extraction fails is skipped
//! 4. write phase: upsert every row inside one transaction, one savepoint
//!    per row, then commit once
//!
//! A failed commit rolls back every primary-table write of the run.

use sqlx::Connection;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{Config, SourceConfig};
use crate::error::{IngestError, Result};
use crate::extract::ExtractionEngine;
use crate::feed::{FeedItem, FeedParser, FeedTransport, HttpTransport, XmlFeedParser};
use crate::reference::ReferenceResolver;
use crate::row::Row;
use crate::schema::{self, CompiledSchema};
use crate::storage::{upsert_row, SqlStorage};

/// Outcome of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Items the parser returned
    pub items_seen: usize,
    /// Rows written in the committed transaction
    pub ingested: usize,
    /// Items dropped by extraction or by a failed upsert
    pub skipped: usize,
    pub duration: Duration,
}

/// Feed-to-table pipeline over one compiled schema and one storage target
pub struct IngestPipeline {
    source: SourceConfig,
    schema: CompiledSchema,
    storage: SqlStorage,
    resolver: ReferenceResolver,
    transport: Box<dyn FeedTransport>,
    parser: Box<dyn FeedParser>,
}

impl IngestPipeline {
    /// Compile the configuration, create missing tables and wire the HTTP
    /// transport and XML parser
    pub async fn from_config(config: &Config, storage: SqlStorage) -> Result<Self> {
        let compiled = schema::compile(&config.schema)?;
        let transport = HttpTransport::new(&config.source)?;
        Self::new(
            config.source.clone(),
            compiled,
            storage,
            Box::new(transport),
            Box::new(XmlFeedParser),
        )
        .await
    }

    /// Assemble a pipeline from explicit collaborators; creates missing tables
    pub async fn new(
        source: SourceConfig,
        schema: CompiledSchema,
        storage: SqlStorage,
        transport: Box<dyn FeedTransport>,
        parser: Box<dyn FeedParser>,
    ) -> Result<Self> {
        storage.create_tables(&schema).await?;
        let resolver = ReferenceResolver::new(storage.pool().clone());

        Ok(Self {
            source,
            schema,
            storage,
            resolver,
            transport,
            parser,
        })
    }

    pub fn schema(&self) -> &CompiledSchema {
        &self.schema
    }

    pub fn storage(&self) -> &SqlStorage {
        &self.storage
    }

    /// Fetch and parse the feed without touching storage
    pub async fn fetch_items(&self) -> Result<Vec<FeedItem>> {
        fetch_items(self.transport.as_ref(), self.parser.as_ref(), &self.source.url).await
    }

    /// Run one ingest cycle
    pub async fn run(&self) -> Result<RunStats> {
        let started = Instant::now();
        let table = &self.schema.primary;
        info!(table = %table.name, url = %self.source.url, "Starting ingest run");

        let items = self.fetch_items().await?;
        let mut stats = RunStats {
            items_seen: items.len(),
            ..RunStats::default()
        };

        let rows = self.extract_rows(&items, &mut stats).await?;

        let mut tx = self.storage.begin().await?;
        for (position, row) in rows {
            let mut savepoint = tx.begin().await?;
            match upsert_row(&mut savepoint, table, &row).await {
                Ok(_) => {
                    savepoint.commit().await?;
                    stats.ingested += 1;
                },
                Err(e) => {
                    savepoint.rollback().await?;
                    warn!(item = position, error = %e, "Skipping item, upsert failed");
                    stats.skipped += 1;
                },
            }
        }

        if let Err(e) = tx.commit().await {
            error!(table = %table.name, error = %e, "Commit failed, run rolled back");
            return Err(IngestError::Commit(e));
        }

        stats.duration = started.elapsed();
        info!(
            table = %table.name,
            items = stats.items_seen,
            ingested = stats.ingested,
            skipped = stats.skipped,
            duration_ms = stats.duration.as_millis() as u64,
            "Ingest run complete"
        );
        Ok(stats)
    }

    /// Extraction phase. Returns rows tagged with their item position.
    async fn extract_rows(&self, items: &[FeedItem], stats: &mut RunStats) -> Result<Vec<(usize, Row)>> {
        let engine = ExtractionEngine::new(&self.schema, &self.resolver);
        let mut rows = Vec::with_capacity(items.len());

        for (position, item) in items.iter().enumerate() {
            match engine.extract(item).await {
                Ok(row) => rows.push((position, row)),
                Err(e) if e.is_recoverable() => {
                    warn!(item = position, error = %e, "Skipping item");
                    stats.skipped += 1;
                },
                Err(e) => return Err(e),
            }
        }

        debug!(rows = rows.len(), skipped = stats.skipped, "Extraction phase done");
        Ok(rows)
    }
}

/// Fetch `url` and parse the document into items
pub async fn fetch_items(
    transport: &dyn FeedTransport,
    parser: &dyn FeedParser,
    url: &str,
) -> Result<Vec<FeedItem>> {
    let body = transport.fetch(url).await?;
    let items = parser.parse(&body)?;
    info!(url = %url, items = items.len(), "Fetched feed items");
    Ok(items)
}

/// Discovery mode: the first item of the feed, without touching storage
pub async fn discover(source: &SourceConfig) -> Result<Option<FeedItem>> {
    let transport = HttpTransport::new(source)?;
    discover_with(&transport, &XmlFeedParser, &source.url).await
}

pub async fn discover_with(
    transport: &dyn FeedTransport,
    parser: &dyn FeedParser,
    url: &str,
) -> Result<Option<FeedItem>> {
    let items = fetch_items(transport, parser, url).await?;
    Ok(items.into_iter().next())
}
