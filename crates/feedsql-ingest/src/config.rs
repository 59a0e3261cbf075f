//! Configuration document
//!
//! A YAML document with two sections:
//!
//! ```yaml
//! source:
//!   url: https://example.org/feed.xml
//!   proxies:
//!     https: http://proxy.local:3128
//! schema:
//!   table: news
//!   fields:
//!     - name: id
//!       val: int(id)
//!       type: INT
//!       primary_key: true
//!     - name: title
//!       val: title
//!     - name: category
//!       val: category
//!       type: REFTABLE
//!       type_parameter: [VARCHAR, 64]
//! ```
//!
//! Older documents use `rss`/`sql`/`tablename`/`field`; those keys are
//! accepted as aliases.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::error::{IngestError, Result};
use crate::schema::REFERENCE_TYPE;

/// Default HTTP timeout for feed fetches, in seconds.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Default storage type of a field.
pub const DEFAULT_FIELD_TYPE: &str = "TEXT";

/// Default user agent sent with feed requests.
pub const DEFAULT_USER_AGENT: &str = concat!("feedsql/", env!("CARGO_PKG_VERSION"));

/// Default maximum storage connections. One session serves a whole run.
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 1;

/// Default storage connection timeout in seconds.
pub const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Top-level configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(alias = "rss")]
    pub source: SourceConfig,

    #[serde(alias = "sql")]
    pub schema: SchemaConfig,
}

/// Feed retrieval parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub url: String,

    /// Scheme (`http`, `https`, `all`) to proxy URL
    #[serde(default)]
    pub proxies: BTreeMap<String, String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub user_agent: Option<String>,
}

impl SourceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            proxies: BTreeMap::new(),
            timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            user_agent: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT)
    }
}

fn default_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

/// Target table plus its field descriptors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    #[serde(alias = "tablename")]
    pub table: String,

    #[serde(alias = "field", default)]
    pub fields: Vec<FieldDescriptor>,
}

/// One target column: storage type, constraints and extraction expression
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,

    /// Expression evaluated against each feed item
    #[serde(rename = "val", alias = "value")]
    pub value_expression: String,

    #[serde(rename = "type", default = "default_field_type")]
    pub sql_type: String,

    /// Scalar or ordered list; shape depends on `type`
    #[serde(rename = "type_parameter", default, skip_serializing_if = "Option::is_none")]
    pub type_parameters: Option<serde_yaml::Value>,

    #[serde(default = "default_true")]
    pub nullable: bool,

    #[serde(default)]
    pub primary_key: bool,

    #[serde(default)]
    pub autoincrement: bool,

    #[serde(rename = "index", default)]
    pub indexed: bool,

    #[serde(default)]
    pub unique: bool,
}

fn default_field_type() -> String {
    DEFAULT_FIELD_TYPE.to_string()
}

fn default_true() -> bool {
    true
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_expression: expression.into(),
            sql_type: default_field_type(),
            type_parameters: None,
            nullable: true,
            primary_key: false,
            autoincrement: false,
            indexed: false,
            unique: false,
        }
    }

    pub fn with_type(mut self, sql_type: impl Into<String>) -> Self {
        self.sql_type = sql_type.into();
        self
    }

    pub fn with_type_parameters(mut self, params: serde_yaml::Value) -> Self {
        self.type_parameters = Some(params);
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn is_reference(&self) -> bool {
        self.sql_type.trim().eq_ignore_ascii_case(REFERENCE_TYPE)
    }

    /// Type parameters as a positional list: nothing, one scalar, or the list
    pub fn type_parameter_list(&self) -> Vec<serde_yaml::Value> {
        positional(self.type_parameters.as_ref())
    }

    /// `(referenceType, referenceTypeParameters)` of a `REFTABLE` field.
    ///
    /// Accepts `refType`, `[refType]` or `[refType, refTypeParameter]`;
    /// the reference type defaults to TEXT.
    pub fn reference_type(&self) -> Result<(String, Vec<serde_yaml::Value>)> {
        let params = self.type_parameter_list();
        let mut iter = params.into_iter();

        let type_name = match iter.next() {
            None => DEFAULT_FIELD_TYPE.to_string(),
            Some(serde_yaml::Value::String(s)) => s,
            Some(other) => {
                return Err(IngestError::config(format!(
                    "Field '{}': REFTABLE type_parameter must start with a type name, got {:?}",
                    self.name, other
                )))
            },
        };

        let type_params = positional(iter.next().as_ref());
        if iter.next().is_some() {
            return Err(IngestError::config(format!(
                "Field '{}': REFTABLE type_parameter takes [type, parameter]",
                self.name
            )));
        }

        Ok((type_name, type_params))
    }
}

fn positional(value: Option<&serde_yaml::Value>) -> Vec<serde_yaml::Value> {
    match value {
        None | Some(serde_yaml::Value::Null) => Vec::new(),
        Some(serde_yaml::Value::Sequence(items)) => items.clone(),
        Some(scalar) => vec![scalar.clone()],
    }
}

impl Config {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(IngestError::config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate a configuration document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)
            .map_err(|e| IngestError::config(format!("Invalid configuration document: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration before any schema work
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.source.url)
            .map_err(|e| IngestError::config(format!("Invalid source url '{}': {}", self.source.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(IngestError::config(format!(
                "Source url must be http or https, got '{}'",
                url.scheme()
            )));
        }

        for (scheme, proxy) in &self.source.proxies {
            if !matches!(scheme.as_str(), "http" | "https" | "all") {
                return Err(IngestError::config(format!(
                    "Unsupported proxy scheme '{}' (expected http, https or all)",
                    scheme
                )));
            }
            url::Url::parse(proxy)
                .map_err(|e| IngestError::config(format!("Invalid proxy url '{}': {}", proxy, e)))?;
        }

        if self.source.timeout_secs == 0 {
            return Err(IngestError::config("Source timeout_secs must be greater than 0"));
        }

        self.schema.validate()
    }
}

impl SchemaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(IngestError::config("Schema table name cannot be empty"));
        }

        if self.fields.is_empty() {
            return Err(IngestError::config(format!(
                "Schema for table '{}' declares no fields",
                self.table
            )));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(IngestError::config("Field name cannot be empty"));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(IngestError::config(format!(
                    "Duplicate field name '{}' in table '{}'",
                    field.name, self.table
                )));
            }
            if field.value_expression.trim().is_empty() {
                return Err(IngestError::config(format!(
                    "Field '{}' has an empty expression",
                    field.name
                )));
            }
        }

        Ok(())
    }
}

/// Storage engine connection settings
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl StorageConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DB_CONNECT_TIMEOUT_SECS,
        }
    }

    /// Load from `FEEDSQL_DATABASE_URL`, `FEEDSQL_DB_MAX_CONNECTIONS` and
    /// `FEEDSQL_DB_CONNECT_TIMEOUT`
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("FEEDSQL_DATABASE_URL")
            .map_err(|_| IngestError::config("FEEDSQL_DATABASE_URL not set"))?;
        Ok(Self::for_url(url))
    }

    /// Settings for `url`, with pool tuning taken from the environment
    pub fn for_url(url: impl Into<String>) -> Self {
        let max_connections = std::env::var("FEEDSQL_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);

        let connect_timeout_secs = std::env::var("FEEDSQL_DB_CONNECT_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_DB_CONNECT_TIMEOUT_SECS);

        Self {
            url: url.into(),
            max_connections,
            connect_timeout_secs,
        }
    }
}
