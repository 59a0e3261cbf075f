//! Feed items and the collaborators that produce them
//!
//! A [`FeedItem`] is a flat attribute record. Field expressions project into
//! it by key, so RSS and Atom documents are normalised onto the same keys:
//!
//! | key | RSS 2.0 | Atom |
//! |---|---|---|
//! | `id` | `guid` | `id` |
//! | `title` | `title` | `title` |
//! | `link` | `link` | first alternate `link@href` |
//! | `summary` | `description` | `summary` |
//! | `content` | `content:encoded` | `content` |
//! | `published` | `pubDate` | `published` |
//! | `updated` | | `updated` |
//! | `author` | `author` / `dc:creator` | first `author/name` |
//! | `category` | first `category` | first `category@term` |
//! | `categories` | all `category` | all `category@term` |
//! | `comments` | `comments` | |

pub mod parser;
pub mod transport;

pub use parser::{FeedFormat, FeedParser, XmlFeedParser};
pub use transport::{FeedTransport, HttpTransport};

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::error::{IngestError, Result};

/// One entry of a parsed feed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FeedItem {
    attributes: Map<String, JsonValue>,
}

impl FeedItem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an item from a JSON object
    pub fn from_json(value: JsonValue) -> Result<Self> {
        match value {
            JsonValue::Object(attributes) => Ok(Self { attributes }),
            other => Err(IngestError::parse(format!(
                "feed item must be an object, got {}",
                other
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.attributes.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Insert only when `value` is present; absent elements stay absent keys
    pub fn insert_opt(&mut self, key: &str, value: Option<String>) {
        if let Some(value) = value {
            self.insert(key, value);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}
