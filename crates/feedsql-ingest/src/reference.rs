//! Reference resolver
//!
//! Maps a raw value to the surrogate key of its row in a reference table,
//! inserting the row on first sight. Inserts run on the pool outside any run
//! transaction and are committed immediately, so a key handed out here stays
//! valid even when the run that asked for it later fails.

use sqlx::sqlite::SqlitePool;
use sqlx::Row as _;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};
use crate::schema::{ReferenceTable, REFERENCE_KEY_COLUMN, REFERENCE_VALUE_COLUMN};
use crate::storage::{bind_value, quote_ident};
use crate::value::Value;

/// Find-or-create lookups against reference tables
#[derive(Debug, Clone)]
pub struct ReferenceResolver {
    pool: SqlitePool,
}

impl ReferenceResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Surrogate key of `value` in `table`, inserting it when absent.
    ///
    /// `value` must already be coerced to the table's value type. Resolving
    /// the same value twice returns the same key.
    pub async fn resolve(&self, table: &ReferenceTable, value: &Value) -> Result<i64> {
        if let Some(id) = self.lookup(table, value).await? {
            return Ok(id);
        }

        let insert = format!(
            "INSERT INTO {} ({}) VALUES (?1)",
            quote_ident(&table.name),
            quote_ident(REFERENCE_VALUE_COLUMN)
        );

        match bind_value(sqlx::query(&insert), value).execute(&self.pool).await {
            Ok(result) => {
                let id = result.last_insert_rowid();
                debug!(table = %table.name, value = %value, id, "Inserted reference value");
                Ok(id)
            },
            // another writer inserted the same value between our lookup and insert
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                warn!(table = %table.name, value = %value, "Reference insert raced, retrying lookup");
                self.lookup(table, value)
                    .await?
                    .ok_or_else(|| IngestError::ReferenceConflict {
                        table: table.name.clone(),
                        value: value.to_string(),
                    })
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn lookup(&self, table: &ReferenceTable, value: &Value) -> Result<Option<i64>> {
        let select = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            quote_ident(REFERENCE_KEY_COLUMN),
            quote_ident(&table.name),
            quote_ident(REFERENCE_VALUE_COLUMN)
        );

        let row = bind_value(sqlx::query(&select), value)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get::<i64, _>(0)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::schema::StorageType;
    use crate::storage::SqlStorage;

    async fn setup() -> (SqlStorage, ReferenceTable) {
        let storage = SqlStorage::connect(&StorageConfig::new("sqlite::memory:"))
            .await
            .unwrap();
        let reference = ReferenceTable::new("news", "category", StorageType::Text { length: None });
        let ddl = crate::storage::create_table_sql(&reference.table_def());
        sqlx::query(&ddl).execute(storage.pool()).await.unwrap();
        (storage, reference)
    }

    #[tokio::test]
    async fn test_resolve_is_find_or_create() {
        let (storage, reference) = setup().await;
        let resolver = ReferenceResolver::new(storage.pool().clone());

        let news = resolver.resolve(&reference, &Value::Text("news".into())).await.unwrap();
        let sports = resolver.resolve(&reference, &Value::Text("sports".into())).await.unwrap();
        let again = resolver.resolve(&reference, &Value::Text("news".into())).await.unwrap();

        assert_eq!(news, again);
        assert_ne!(news, sports);
        assert_eq!(storage.count_rows(&reference.name).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_resolve_finds_preexisting_value() {
        let (storage, reference) = setup().await;
        sqlx::query(r#"INSERT INTO "news_REF_category" ("value") VALUES ('local')"#)
            .execute(storage.pool())
            .await
            .unwrap();

        let resolver = ReferenceResolver::new(storage.pool().clone());
        let id = resolver.resolve(&reference, &Value::Text("local".into())).await.unwrap();

        assert_eq!(id, 1);
        assert_eq!(storage.count_rows(&reference.name).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolvers_agree_on_one_key() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("refs.db").display());
        let storage = SqlStorage::connect(&StorageConfig {
            max_connections: 8,
            ..StorageConfig::new(url)
        })
        .await
        .unwrap();
        let reference = ReferenceTable::new("news", "category", StorageType::Text { length: None });
        let ddl = crate::storage::create_table_sql(&reference.table_def());
        sqlx::query(&ddl).execute(storage.pool()).await.unwrap();

        let resolver = ReferenceResolver::new(storage.pool().clone());
        for round in 0..20 {
            let value = Value::Text(format!("value-{}", round));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let resolver = resolver.clone();
                    let reference = reference.clone();
                    let value = value.clone();
                    tokio::spawn(async move { resolver.resolve(&reference, &value).await })
                })
                .collect();

            let mut keys = Vec::new();
            for handle in handles {
                keys.push(handle.await.unwrap().unwrap());
            }
            assert!(keys.iter().all(|k| *k == keys[0]), "round {}: {:?}", round, keys);
        }

        assert_eq!(storage.count_rows(&reference.name).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_missing_table_is_database_error() {
        let storage = SqlStorage::connect(&StorageConfig::new("sqlite::memory:"))
            .await
            .unwrap();
        let reference = ReferenceTable::new("news", "category", StorageType::Text { length: None });
        let resolver = ReferenceResolver::new(storage.pool().clone());
        let err = resolver
            .resolve(&reference, &Value::Text("news".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Database(_)));
    }
}
