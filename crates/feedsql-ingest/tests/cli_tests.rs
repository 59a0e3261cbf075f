//! End-to-end tests for the feedsql binary
//!
//! Covers argument handling and exit codes, discovery mode and a full ingest
//! run into an SQLite file.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>CLI test feed</title>
    <item>
      <guid>1</guid>
      <title>Hello from the feed</title>
      <category>news</category>
    </item>
    <item>
      <guid>2</guid>
      <title>Second item</title>
      <category>news</category>
    </item>
  </channel>
</rss>"#;

fn write_config(dir: &Path, url: &str, type_name: &str) -> PathBuf {
    let path = dir.join("feed.yaml");
    let yaml = format!(
        r#"
source:
  url: {url}
schema:
  table: posts
  fields:
    - name: id
      val: id
      type: {type_name}
      primary_key: true
    - name: title
      val: title
    - name: category
      val: category
      type: REFTABLE
"#
    );
    std::fs::write(&path, yaml).unwrap();
    path
}

async fn feed_server(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(status).set_body_string(FEED))
        .mount(&server)
        .await;
    server
}

fn feedsql() -> Command {
    let mut cmd = Command::cargo_bin("feedsql").unwrap();
    cmd.env_remove("FEEDSQL_DATABASE_URL")
        .env("LOG_LEVEL", "warn");
    cmd
}

// ============================================================================
// Argument handling
// ============================================================================

#[test]
fn test_missing_config_exits_with_1() {
    feedsql()
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--config"));
}

#[tokio::test]
async fn test_missing_database_exits_with_1() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "https://example.org/feed.xml", "INT");

    feedsql()
        .arg("--config")
        .arg(&config)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--database"));
}

#[test]
fn test_missing_config_file_exits_with_1() {
    feedsql()
        .args(["--config", "/nonexistent/feed.yaml", "--database", "sqlite::memory:"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Configuration file not found"));
}

#[tokio::test]
async fn test_unknown_type_exits_with_1() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "https://example.org/feed.xml", "BLOB9000");

    feedsql()
        .arg("--config")
        .arg(&config)
        .args(["--database", "sqlite::memory:"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("BLOB9000"));
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn test_discover_prints_first_item() {
    let server = feed_server(200).await;
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), &format!("{}/feed.xml", server.uri()), "INT");

    feedsql()
        .arg("--config")
        .arg(&config)
        .arg("--discover")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"title\": \"Hello from the feed\""))
        .stdout(predicate::str::contains("Second item").not());
}

// ============================================================================
// Ingest runs
// ============================================================================

#[tokio::test]
async fn test_run_ingests_into_sqlite_file() {
    let server = feed_server(200).await;
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), &format!("{}/feed.xml", server.uri()), "INT");
    let database = format!("sqlite://{}", dir.path().join("feeds.db").display());

    feedsql()
        .arg("--config")
        .arg(&config)
        .args(["--database", &database])
        .assert()
        .success();

    let pool = sqlx::SqlitePool::connect(&database).await.unwrap();
    let titles: Vec<String> = sqlx::query_scalar(r#"SELECT "title" FROM "posts" ORDER BY "id""#)
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(titles, vec!["Hello from the feed", "Second item"]);

    let references: i64 = sqlx::query_scalar(r#"SELECT COUNT(*) FROM "posts_REF_category""#)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(references, 1);
}

#[tokio::test]
async fn test_failed_fetch_still_exits_with_0() {
    let server = feed_server(500).await;
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), &format!("{}/feed.xml", server.uri()), "INT");
    let database = format!("sqlite://{}", dir.path().join("feeds.db").display());

    feedsql()
        .arg("--config")
        .arg(&config)
        .args(["--database", &database])
        .assert()
        .success()
        .stderr(predicate::str::contains("500"));
}
