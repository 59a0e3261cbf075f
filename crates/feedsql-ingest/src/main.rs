//! feedsql - main entry point

use clap::Parser;
use feedsql_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use feedsql_ingest::Cli;
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let level = if cli.verbose { LogLevel::Debug } else { LogLevel::Info };
    let log_config = LogConfig::builder()
        .level(level)
        .output(LogOutput::Console)
        .log_file_prefix("feedsql")
        .build();

    // environment variables take precedence over the flags
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    // keep the guard alive so buffered file logs are flushed on exit
    let log_guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: failed to initialize logging: {}", e);
            None
        },
    };

    if let Err(e) = feedsql_ingest::cli::execute(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        drop(log_guard);
        process::exit(1);
    }
}
