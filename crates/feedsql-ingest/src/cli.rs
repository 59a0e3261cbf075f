//! Command-line surface
//!
//! ```text
//! feedsql --config news.yaml --database sqlite://news.db
//! feedsql --config news.yaml --database sqlite://news.db --interval 600
//! feedsql --config news.yaml --discover
//! ```
//!
//! Missing arguments and configuration or schema errors are returned as
//! errors (exit code 1). A run that fails after it started is logged and
//! reported on stderr, but still counts as an attempted run (exit code 0).

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::{Config, StorageConfig};
use crate::error::{IngestError, Result};
use crate::feed::{HttpTransport, XmlFeedParser};
use crate::pipeline::{self, IngestPipeline};
use crate::scheduler::Scheduler;
use crate::schema;
use crate::storage::SqlStorage;

/// Ingest an RSS or Atom feed into SQL tables described by a YAML file
#[derive(Parser, Debug)]
#[command(name = "feedsql")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (source and schema sections)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Database connection string, e.g. sqlite://feeds.db
    #[arg(short, long, env = "FEEDSQL_DATABASE_URL", value_name = "URL")]
    pub database: Option<String>,

    /// Fetch the feed and print its first item as JSON, without touching storage
    #[arg(long)]
    pub discover: bool,

    /// Keep running, one ingest run every SECS seconds
    #[arg(long, value_name = "SECS")]
    pub interval: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Execute the command described by `cli`
pub async fn execute(cli: &Cli) -> Result<()> {
    let config_path = cli
        .config
        .as_ref()
        .ok_or_else(|| IngestError::config("the --config <FILE> argument is required"))?;
    let config = Config::load(config_path)?;

    if cli.discover {
        discover(&config).await;
        return Ok(());
    }

    let database = cli.database.as_deref().ok_or_else(|| {
        IngestError::config("the --database <URL> argument (or FEEDSQL_DATABASE_URL) is required")
    })?;

    let interval = match cli.interval {
        Some(0) => return Err(IngestError::config("--interval must be greater than 0")),
        Some(secs) => Some(Duration::from_secs(secs)),
        None => None,
    };

    // compile before touching storage so a bad schema leaves no trace
    let schema = schema::compile(&config.schema)?;
    let transport = HttpTransport::new(&config.source)?;
    let storage = SqlStorage::connect(&StorageConfig::for_url(database)).await?;
    let pipeline = IngestPipeline::new(
        config.source.clone(),
        schema,
        storage,
        Box::new(transport),
        Box::new(XmlFeedParser),
    )
    .await?;

    match interval {
        Some(interval) => {
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            };
            Scheduler::new(interval).run_until(&pipeline, shutdown).await;
        },
        None => {
            if let Err(e) = pipeline.run().await {
                error!(error = %e, "Ingest run failed");
                eprintln!("Error: {}", e);
            }
        },
    }

    Ok(())
}

async fn discover(config: &Config) {
    match pipeline::discover(&config.source).await {
        Ok(Some(item)) => match serde_json::to_string_pretty(&item) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error: cannot render item: {}", e),
        },
        Ok(None) => warn!(url = %config.source.url, "Feed has no items"),
        Err(e) => {
            error!(error = %e, "Discovery failed");
            eprintln!("Error: {}", e);
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        let cli = Cli::try_parse_from([
            "feedsql",
            "-c",
            "news.yaml",
            "--database",
            "sqlite::memory:",
            "--interval",
            "60",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("news.yaml")));
        assert_eq!(cli.database.as_deref(), Some("sqlite::memory:"));
        assert_eq!(cli.interval, Some(60));
        assert!(!cli.discover);
    }

    #[tokio::test]
    async fn test_missing_config_is_error() {
        let cli = Cli::try_parse_from(["feedsql", "--discover"]).unwrap();
        assert!(matches!(execute(&cli).await, Err(IngestError::Config(_))));
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.yaml");
        std::fs::write(
            &path,
            "source:\n  url: https://example.org/feed\nschema:\n  table: t\n  fields:\n    - {name: title, val: title}\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "feedsql",
            "--config",
            path.to_str().unwrap(),
            "--database",
            "sqlite::memory:",
            "--interval",
            "0",
        ])
        .unwrap();
        assert!(matches!(execute(&cli).await, Err(IngestError::Config(_))));
    }
}
