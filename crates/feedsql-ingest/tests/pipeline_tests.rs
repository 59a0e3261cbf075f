//! End-to-end tests for the ingest pipeline
//!
//! These drive full runs (fetch → parse → extract → write) against an
//! in-memory SQLite database:
//! - the news/category scenario with a shared reference key
//! - idempotent upserts across runs
//! - reference deduplication
//! - fatal fetch failures and failed commits
//! - per-item isolation in both extraction and write phases
//! - the real HTTP transport against a mock server

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use feedsql_ingest::{
    compile, Config, FeedTransport, IngestError, IngestPipeline, SqlStorage, StorageConfig,
    XmlFeedParser,
};
use std::sync::{Arc, Mutex};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const NEWS_CONFIG: &str = r#"
source:
  url: https://example.org/feed.xml
schema:
  table: news
  fields:
    - name: id
      val: id
      type: INT
      primary_key: true
    - name: title
      val: title
    - name: category
      val: category
      type: REFTABLE
      type_parameter: TEXT
"#;

/// Transport stub answering with a fixed body or a failure status
#[derive(Clone)]
struct StubTransport {
    response: Arc<Mutex<Result<String, u16>>>,
}

impl StubTransport {
    fn body(body: String) -> Self {
        Self {
            response: Arc::new(Mutex::new(Ok(body))),
        }
    }

    fn status(status: u16) -> Self {
        Self {
            response: Arc::new(Mutex::new(Err(status))),
        }
    }

    fn set_body(&self, body: String) {
        *self.response.lock().unwrap() = Ok(body);
    }
}

#[async_trait]
impl FeedTransport for StubTransport {
    async fn fetch(&self, _url: &str) -> feedsql_ingest::Result<Vec<u8>> {
        match &*self.response.lock().unwrap() {
            Ok(body) => Ok(body.clone().into_bytes()),
            Err(status) => Err(IngestError::fetch(Some(*status), "stub failure")),
        }
    }
}

/// RSS document with one item per (guid, title, category)
fn rss(items: &[(&str, &str, &str)]) -> String {
    let items: String = items
        .iter()
        .map(|(id, title, category)| {
            format!(
                "<item><guid>{}</guid><title>{}</title><category>{}</category></item>",
                id, title, category
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Test</title>{}</channel></rss>"#,
        items
    )
}

async fn memory_storage() -> SqlStorage {
    SqlStorage::connect(&StorageConfig::new("sqlite::memory:"))
        .await
        .unwrap()
}

async fn pipeline(config: &str, transport: StubTransport) -> IngestPipeline {
    pipeline_on(memory_storage().await, config, transport).await
}

/// Pipeline over `storage`, which may already hold some of the schema's tables
async fn pipeline_on(storage: SqlStorage, config: &str, transport: StubTransport) -> IngestPipeline {
    let config = Config::from_yaml_str(config).unwrap();
    let schema = compile(&config.schema).unwrap();

    IngestPipeline::new(
        config.source.clone(),
        schema,
        storage,
        Box::new(transport),
        Box::new(XmlFeedParser),
    )
    .await
    .unwrap()
}

async fn news_rows(pipeline: &IngestPipeline) -> Vec<(i64, String, i64)> {
    sqlx::query_as(r#"SELECT "id", "title", "category" FROM "news" ORDER BY "id""#)
        .fetch_all(pipeline.storage().pool())
        .await
        .unwrap()
}

async fn categories(pipeline: &IngestPipeline) -> Vec<(i64, String)> {
    sqlx::query_as(r#"SELECT "id", "value" FROM "news_REF_category" ORDER BY "id""#)
        .fetch_all(pipeline.storage().pool())
        .await
        .unwrap()
}

// ============================================================================
// Scenario
// ============================================================================

#[tokio::test]
async fn test_two_items_share_reference_key() {
    let transport = StubTransport::body(rss(&[("1", "A", "news"), ("2", "B", "news")]));
    let pipeline = pipeline(NEWS_CONFIG, transport).await;

    let stats = pipeline.run().await.unwrap();
    assert_eq!(stats.items_seen, 2);
    assert_eq!(stats.ingested, 2);
    assert_eq!(stats.skipped, 0);

    let refs = categories(&pipeline).await;
    assert_eq!(refs.len(), 1);
    let (k, value) = refs[0].clone();
    assert_eq!(value, "news");

    assert_eq!(
        news_rows(&pipeline).await,
        vec![(1, "A".to_string(), k), (2, "B".to_string(), k)]
    );
}

// ============================================================================
// Upsert and deduplication
// ============================================================================

#[tokio::test]
async fn test_reingesting_item_overwrites_row() {
    let transport = StubTransport::body(rss(&[("1", "First title", "news")]));
    let pipeline = pipeline(NEWS_CONFIG, transport.clone()).await;

    pipeline.run().await.unwrap();
    transport.set_body(rss(&[("1", "Second title", "sports")]));
    let stats = pipeline.run().await.unwrap();
    assert_eq!(stats.ingested, 1);

    let rows = news_rows(&pipeline).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1, "Second title");

    let refs = categories(&pipeline).await;
    let sports = refs.iter().find(|(_, v)| v == "sports").unwrap().0;
    assert_eq!(rows[0].2, sports);
}

#[tokio::test]
async fn test_same_feed_twice_is_idempotent() {
    let body = rss(&[("1", "A", "news"), ("2", "B", "local")]);
    let pipeline = pipeline(NEWS_CONFIG, StubTransport::body(body)).await;

    pipeline.run().await.unwrap();
    let first = news_rows(&pipeline).await;
    pipeline.run().await.unwrap();

    assert_eq!(news_rows(&pipeline).await, first);
    assert_eq!(categories(&pipeline).await.len(), 2);
}

#[tokio::test]
async fn test_reference_values_are_deduplicated() {
    let items: Vec<(String, String)> = (1..=5).map(|i| (i.to_string(), format!("Post {}", i))).collect();
    let triples: Vec<(&str, &str, &str)> = items
        .iter()
        .map(|(id, title)| (id.as_str(), title.as_str(), "weather"))
        .collect();
    let pipeline = pipeline(NEWS_CONFIG, StubTransport::body(rss(&triples))).await;

    let stats = pipeline.run().await.unwrap();
    assert_eq!(stats.ingested, 5);

    let refs = categories(&pipeline).await;
    assert_eq!(refs.len(), 1);

    let rows = news_rows(&pipeline).await;
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|(_, _, key)| *key == refs[0].0));
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_fetch_failure_writes_nothing() {
    let pipeline = pipeline(NEWS_CONFIG, StubTransport::status(500)).await;

    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(err, IngestError::Fetch { status: Some(500), .. }));
    assert_eq!(pipeline.storage().count_rows("news").await.unwrap(), 0);
    assert_eq!(
        pipeline.storage().count_rows("news_REF_category").await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_failing_item_is_skipped() {
    // the second guid is not an integer, so its id column cannot be filled
    let transport = StubTransport::body(rss(&[
        ("1", "A", "news"),
        ("two", "B", "orphan"),
        ("3", "C", "news"),
    ]));
    let pipeline = pipeline(NEWS_CONFIG, transport).await;

    let stats = pipeline.run().await.unwrap();
    assert_eq!(stats.items_seen, 3);
    assert_eq!(stats.ingested, 2);
    assert_eq!(stats.skipped, 1);

    let ids: Vec<i64> = news_rows(&pipeline).await.into_iter().map(|r| r.0).collect();
    assert_eq!(ids, vec![1, 3]);

    // the skipped item never reached reference resolution
    let values: Vec<String> = categories(&pipeline).await.into_iter().map(|r| r.1).collect();
    assert_eq!(values, vec!["news".to_string()]);
}

#[tokio::test]
async fn test_commit_failure_rolls_back_run() {
    // existing table whose category key must point into an empty table,
    // checked only when the run commits
    let storage = memory_storage().await;
    for ddl in [
        r#"CREATE TABLE "parent" ("id" INTEGER PRIMARY KEY)"#,
        r#"CREATE TABLE "news" (
            "id" INTEGER NOT NULL PRIMARY KEY,
            "title" TEXT,
            "category" INTEGER NOT NULL REFERENCES "parent"("id") DEFERRABLE INITIALLY DEFERRED
        )"#,
    ] {
        sqlx::query(ddl).execute(storage.pool()).await.unwrap();
    }

    let transport = StubTransport::body(rss(&[("1", "A", "news"), ("2", "B", "news")]));
    let pipeline = pipeline_on(storage, NEWS_CONFIG, transport).await;

    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(err, IngestError::Commit(_)), "{:?}", err);
    assert_eq!(pipeline.storage().count_rows("news").await.unwrap(), 0);

    // reference rows were committed on their own during extraction
    assert_eq!(
        pipeline.storage().count_rows("news_REF_category").await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_failed_upsert_is_skipped_and_run_commits() {
    let storage = memory_storage().await;
    sqlx::query(
        r#"CREATE TABLE "news" (
            "id" INTEGER NOT NULL PRIMARY KEY,
            "title" TEXT CHECK (length("title") < 10),
            "category" INTEGER NOT NULL
        )"#,
    )
    .execute(storage.pool())
    .await
    .unwrap();

    let transport = StubTransport::body(rss(&[
        ("1", "A", "news"),
        ("2", "A title far too long", "news"),
        ("3", "C", "news"),
    ]));
    let pipeline = pipeline_on(storage, NEWS_CONFIG, transport).await;

    let stats = pipeline.run().await.unwrap();
    assert_eq!(stats.items_seen, 3);
    assert_eq!(stats.ingested, 2);
    assert_eq!(stats.skipped, 1);

    let ids: Vec<i64> = news_rows(&pipeline).await.into_iter().map(|r| r.0).collect();
    assert_eq!(ids, vec![1, 3]);
}

#[tokio::test]
async fn test_missing_attribute_skips_item() {
    let body = r#"<rss version="2.0"><channel>
        <item><guid>1</guid><title>A</title><category>news</category></item>
        <item><guid>2</guid><title>B</title></item>
    </channel></rss>"#;
    let pipeline = pipeline(NEWS_CONFIG, StubTransport::body(body.to_string())).await;

    let stats = pipeline.run().await.unwrap();
    assert_eq!(stats.ingested, 1);
    assert_eq!(stats.skipped, 1);
}

#[tokio::test]
async fn test_unparsable_document_aborts_run() {
    let pipeline = pipeline(
        NEWS_CONFIG,
        StubTransport::body("<html><body>Not a feed</body></html>".to_string()),
    )
    .await;

    assert!(matches!(pipeline.run().await, Err(IngestError::Parse(_))));
    assert_eq!(pipeline.storage().count_rows("news").await.unwrap(), 0);
}

// ============================================================================
// Expressions and coercion
// ============================================================================

#[tokio::test]
async fn test_expressions_and_unique_upsert_key() {
    let config = r#"
source:
  url: https://example.org/feed.xml
schema:
  table: links
  fields:
    - name: row_id
      val: "null"
      type: INT
      primary_key: true
      autoincrement: true
    - name: link
      val: "'https://example.org/' + id"
      type: VARCHAR
      type_parameter: 255
      unique: true
    - name: headline
      val: upper(title)
    - name: title_length
      val: len(title)
      type: INT
      index: true
"#;
    let transport = StubTransport::body(rss(&[("a", "hello", "x"), ("b", "world!", "x")]));
    let pipeline = pipeline(config, transport).await;

    pipeline.run().await.unwrap();
    let second = pipeline.run().await.unwrap();
    assert_eq!(second.ingested, 2);
    assert_eq!(second.skipped, 0);

    let rows: Vec<(String, String, i64)> =
        sqlx::query_as(r#"SELECT "link", "headline", "title_length" FROM "links" ORDER BY "link""#)
            .fetch_all(pipeline.storage().pool())
            .await
            .unwrap();
    assert_eq!(
        rows,
        vec![
            ("https://example.org/a".to_string(), "HELLO".to_string(), 5),
            ("https://example.org/b".to_string(), "WORLD!".to_string(), 6),
        ]
    );
}

// ============================================================================
// HTTP transport
// ============================================================================

#[tokio::test]
async fn test_run_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(rss(&[("10", "Over the wire", "net")]))
                .insert_header("content-type", "application/rss+xml"),
        )
        .mount(&server)
        .await;

    let yaml = NEWS_CONFIG.replace(
        "https://example.org/feed.xml",
        &format!("{}/feed.xml", server.uri()),
    );
    let config = Config::from_yaml_str(&yaml).unwrap();
    let pipeline = IngestPipeline::from_config(&config, memory_storage().await)
        .await
        .unwrap();

    let stats = pipeline.run().await.unwrap();
    assert_eq!(stats.ingested, 1);
    assert_eq!(news_rows(&pipeline).await[0].1, "Over the wire");
}

#[tokio::test]
async fn test_http_error_status_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let yaml = NEWS_CONFIG.replace("https://example.org/feed.xml", &server.uri());
    let config = Config::from_yaml_str(&yaml).unwrap();
    let pipeline = IngestPipeline::from_config(&config, memory_storage().await)
        .await
        .unwrap();

    assert!(matches!(
        pipeline.run().await,
        Err(IngestError::Fetch { status: Some(500), .. })
    ));
    assert_eq!(pipeline.storage().count_rows("news").await.unwrap(), 0);
}
