//! RSS 2.0 and Atom parsing
//!
//! The root element decides the dialect; the document is then deserialized
//! with quick-xml's serde support and each entry is normalised into a
//! [`FeedItem`].

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use tracing::debug;

use super::FeedItem;
use crate::error::{IngestError, Result};

/// Turns a raw feed document into items, in document order
pub trait FeedParser: Send + Sync {
    fn parse(&self, body: &[u8]) -> Result<Vec<FeedItem>>;
}

/// Supported feed dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    Rss,
    Atom,
}

impl FeedFormat {
    /// Inspect the root element of `body`
    pub fn detect(body: &[u8]) -> Result<Self> {
        let mut reader = Reader::from_reader(body);
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                    return match e.local_name().as_ref() {
                        b"rss" => Ok(FeedFormat::Rss),
                        b"feed" => Ok(FeedFormat::Atom),
                        other => Err(IngestError::parse(format!(
                            "Unsupported root element <{}>, expected <rss> or <feed>",
                            String::from_utf8_lossy(other)
                        ))),
                    };
                },
                Ok(Event::Eof) => return Err(IngestError::parse("Document has no root element")),
                Err(e) => {
                    return Err(IngestError::parse(format!(
                        "Malformed XML at position {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                },
                Ok(_) => {},
            }
            buf.clear();
        }
    }
}

/// quick-xml backed parser for RSS 2.0 and Atom 1.0
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlFeedParser;

impl FeedParser for XmlFeedParser {
    fn parse(&self, body: &[u8]) -> Result<Vec<FeedItem>> {
        let format = FeedFormat::detect(body)?;
        let text = std::str::from_utf8(body)
            .map_err(|e| IngestError::parse(format!("Feed is not valid UTF-8: {}", e)))?;
        let text = text.trim_start_matches('\u{feff}');

        let items: Vec<FeedItem> = match format {
            FeedFormat::Rss => {
                let rss: Rss = quick_xml::de::from_str(text)
                    .map_err(|e| IngestError::parse(format!("Invalid RSS document: {}", e)))?;
                rss.channel.items.into_iter().map(RssItem::into_feed_item).collect()
            },
            FeedFormat::Atom => {
                let feed: AtomFeed = quick_xml::de::from_str(text)
                    .map_err(|e| IngestError::parse(format!("Invalid Atom document: {}", e)))?;
                feed.entries.into_iter().map(AtomEntry::into_feed_item).collect()
            },
        };

        debug!(format = ?format, items = items.len(), "Parsed feed");
        Ok(items)
    }
}

/// Element text, ignoring any attributes
#[derive(Debug, Default, Deserialize)]
struct Text {
    #[serde(rename = "$text", default)]
    value: String,
}

impl Text {
    fn into_opt(self) -> Option<String> {
        let value = self.value.trim();
        (!value.is_empty()).then(|| value.to_string())
    }
}

// ============================================================================
// RSS 2.0
// ============================================================================

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    guid: Option<Text>,
    title: Option<Text>,
    link: Option<Text>,
    description: Option<Text>,
    #[serde(rename = "content:encoded", alias = "encoded")]
    content: Option<Text>,
    #[serde(rename = "pubDate")]
    pub_date: Option<Text>,
    author: Option<Text>,
    #[serde(rename = "dc:creator", alias = "creator")]
    creator: Option<Text>,
    #[serde(rename = "category", default)]
    categories: Vec<Text>,
    comments: Option<Text>,
}

impl RssItem {
    fn into_feed_item(self) -> FeedItem {
        let mut item = FeedItem::new();
        item.insert_opt("id", self.guid.and_then(Text::into_opt));
        item.insert_opt("title", self.title.and_then(Text::into_opt));
        item.insert_opt("link", self.link.and_then(Text::into_opt));
        item.insert_opt("summary", self.description.and_then(Text::into_opt));
        item.insert_opt("content", self.content.and_then(Text::into_opt));
        item.insert_opt("published", self.pub_date.and_then(Text::into_opt));
        item.insert_opt(
            "author",
            self.author
                .and_then(Text::into_opt)
                .or_else(|| self.creator.and_then(Text::into_opt)),
        );
        item.insert_opt("comments", self.comments.and_then(Text::into_opt));
        insert_categories(
            &mut item,
            self.categories.into_iter().filter_map(Text::into_opt).collect(),
        );
        item
    }
}

// ============================================================================
// Atom 1.0
// ============================================================================

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    id: Option<Text>,
    title: Option<Text>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    summary: Option<Text>,
    content: Option<Text>,
    published: Option<Text>,
    updated: Option<Text>,
    #[serde(rename = "author", default)]
    authors: Vec<AtomPerson>,
    #[serde(rename = "category", default)]
    categories: Vec<AtomCategory>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href", default)]
    href: String,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomPerson {
    name: Option<Text>,
}

#[derive(Debug, Deserialize)]
struct AtomCategory {
    #[serde(rename = "@term", default)]
    term: String,
}

impl AtomEntry {
    fn into_feed_item(self) -> FeedItem {
        // rel defaults to "alternate" when omitted
        let link = self
            .links
            .iter()
            .find(|l| l.rel.as_deref().unwrap_or("alternate") == "alternate")
            .or_else(|| self.links.first())
            .map(|l| l.href.trim().to_string())
            .filter(|href| !href.is_empty());

        let mut item = FeedItem::new();
        item.insert_opt("id", self.id.and_then(Text::into_opt));
        item.insert_opt("title", self.title.and_then(Text::into_opt));
        item.insert_opt("link", link);
        item.insert_opt("summary", self.summary.and_then(Text::into_opt));
        item.insert_opt("content", self.content.and_then(Text::into_opt));
        item.insert_opt("published", self.published.and_then(Text::into_opt));
        item.insert_opt("updated", self.updated.and_then(Text::into_opt));
        item.insert_opt(
            "author",
            self.authors
                .into_iter()
                .find_map(|a| a.name.and_then(Text::into_opt)),
        );
        insert_categories(
            &mut item,
            self.categories
                .into_iter()
                .map(|c| c.term.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        );
        item
    }
}

fn insert_categories(item: &mut FeedItem, categories: Vec<String>) {
    if categories.is_empty() {
        return;
    }
    item.insert("category", categories[0].clone());
    item.insert("categories", categories);
}
