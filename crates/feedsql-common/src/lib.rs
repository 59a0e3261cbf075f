//! feedsql common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Process-wide plumbing shared by the feedsql workspace members. Today that
//! is the tracing subscriber setup used by the `feedsql` binary and by any
//! tooling that embeds the ingest library.
//!
//! # Example
//!
//! ```no_run
//! use feedsql_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LogLevel, LogOutput};
