//! Error types for feed ingestion
//!
//! Compile-time errors (`Config`, `UnknownType`) stop the process before the
//! pipeline starts. Run-level errors (`Fetch`, `Parse`, `Commit`) abort one
//! run. `Extraction` and `ReferenceConflict` are scoped to a single item or a
//! single insert and never abort a run on their own.

use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Main error type for feedsql ingestion
#[derive(Error, Debug)]
pub enum IngestError {
    /// Malformed or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A field descriptor names a storage type outside the vocabulary
    #[error("Unknown storage type '{type_name}' for field '{field}'")]
    UnknownType { field: String, type_name: String },

    /// Feed source unreachable or answered with a non-success status
    #[error("Feed fetch failed{}: {message}", status_suffix(.status))]
    Fetch { status: Option<u16>, message: String },

    /// Feed document is not a readable RSS or Atom document
    #[error("Feed parse error: {0}")]
    Parse(String),

    /// A single item's field could not be extracted
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// A reference value was inserted concurrently and could not be read back
    #[error("Reference conflict on table '{table}' for value '{value}'")]
    ReferenceConflict { table: String, value: String },

    /// The run transaction failed to commit; its writes were rolled back
    #[error("Commit failed, run rolled back: {0}")]
    Commit(#[source] sqlx::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" with status {}", s)).unwrap_or_default()
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn fetch(status: Option<u16>, msg: impl Into<String>) -> Self {
        Self::Fetch {
            status,
            message: msg.into(),
        }
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Whether the error only affects one item or one insert attempt
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IngestError::Extraction(_) | IngestError::ReferenceConflict { .. }
        )
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        IngestError::Fetch {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

/// Failure to turn one feed item into one row
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("Item has no attribute '{0}'")]
    MissingAttribute(String),

    #[error("Type mismatch: expected {expected}, got {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Field '{0}' is not nullable but evaluated to null")]
    NullValue(String),

    #[error("Cannot parse '{0}' as a timestamp")]
    InvalidTimestamp(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// Wraps another extraction error with the field it came from
    #[error("Field '{field}': {source}")]
    Field {
        field: String,
        #[source]
        source: Box<ExtractionError>,
    },
}

impl ExtractionError {
    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation(msg.into())
    }

    /// Attach the field name, unless one is already attached
    pub fn in_field(self, field: &str) -> Self {
        match self {
            err @ ExtractionError::Field { .. } => err,
            err @ ExtractionError::NullValue(_) => err,
            err => ExtractionError::Field {
                field: field.to_string(),
                source: Box::new(err),
            },
        }
    }
}
