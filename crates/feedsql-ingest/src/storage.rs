//! SQLite storage engine
//!
//! Renders DDL and upsert statements from compiled [`TableDef`]s and binds
//! [`Value`]s onto them. Tables are created only when missing; existing
//! tables are never altered.

use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::{Row as _, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::Result;
use crate::row::Row;
use crate::schema::{CompiledSchema, TableDef};
use crate::value::Value;

/// Open a connection pool, creating the database file when missing
pub async fn connect(config: &StorageConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let mut pool_options = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs));

    // an in-memory database lives only as long as its single connection
    if config.url.contains(":memory:") {
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    let pool = pool_options.connect_with(options).await?;
    info!(url = %config.url, max_connections = config.max_connections, "Connected to database");
    Ok(pool)
}

/// Table-level storage operations over one pool
#[derive(Debug, Clone)]
pub struct SqlStorage {
    pool: SqlitePool,
}

impl SqlStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        Ok(Self::new(connect(config).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create every table of `schema` that does not exist yet, reference
    /// tables first, then their indexes
    pub async fn create_tables(&self, schema: &CompiledSchema) -> Result<()> {
        for table in schema.table_defs() {
            let ddl = create_table_sql(&table);
            debug!(sql = %ddl, "Creating table if missing");
            sqlx::query(&ddl).execute(&self.pool).await?;

            for index in create_index_sql(&table) {
                debug!(sql = %index, "Creating index if missing");
                sqlx::query(&index).execute(&self.pool).await?;
            }
        }

        info!(table = %schema.primary.name, references = schema.references.len(), "Schema ready");
        Ok(())
    }

    /// Start the transaction a run writes its rows in
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn count_rows(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }
}

/// Insert `row` into `table`, replacing the non-key columns of an existing
/// row with the same key
pub async fn upsert_row(conn: &mut SqliteConnection, table: &TableDef, row: &Row) -> Result<u64> {
    // an autoincrement key left null is assigned by the engine
    let bound: Vec<(&str, &Value)> = row
        .iter()
        .filter(|(name, value)| {
            !(value.is_null() && table.column(name).is_some_and(|c| c.primary_key && c.autoincrement))
        })
        .collect();
    let columns: Vec<&str> = bound.iter().map(|(name, _)| *name).collect();

    let sql = upsert_sql(table, &columns);
    let mut query = sqlx::query(&sql);
    for (_, value) in &bound {
        query = bind_value(query, value);
    }

    let result = query.execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

/// Quote an identifier for SQLite
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `CREATE TABLE IF NOT EXISTS` for one table definition
pub fn create_table_sql(table: &TableDef) -> String {
    let keys = table.primary_key_columns();
    let inline_key = keys.len() == 1 && keys[0].autoincrement;

    let mut parts: Vec<String> = table
        .columns
        .iter()
        .map(|column| {
            // SQLite only accepts AUTOINCREMENT on an inline INTEGER PRIMARY KEY
            if inline_key && column.primary_key {
                return format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote_ident(&column.name));
            }
            let mut def = format!("{} {}", quote_ident(&column.name), column.storage_type.sql());
            if !column.nullable {
                def.push_str(" NOT NULL");
            }
            if column.unique {
                def.push_str(" UNIQUE");
            }
            if let Some(fk) = &column.references {
                def.push_str(&format!(
                    " REFERENCES {}({})",
                    quote_ident(&fk.table),
                    quote_ident(&fk.column)
                ));
            }
            def
        })
        .collect();

    if !keys.is_empty() && !inline_key {
        let names: Vec<String> = keys.iter().map(|c| quote_ident(&c.name)).collect();
        parts.push(format!("PRIMARY KEY ({})", names.join(", ")));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(&table.name),
        parts.join(", ")
    )
}

/// One `CREATE INDEX IF NOT EXISTS` per indexed column
pub fn create_index_sql(table: &TableDef) -> Vec<String> {
    table
        .columns
        .iter()
        .filter(|c| c.indexed)
        .map(|c| {
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_ident(&index_name(&table.name, &c.name)),
                quote_ident(&table.name),
                quote_ident(&c.name)
            )
        })
        .collect()
}

/// `ix_<len>_<table>_<column>`; the table name length keeps `a_b.c` and `a.b_c` apart
fn index_name(table: &str, column: &str) -> String {
    format!("ix_{}_{}_{}", table.len(), table, column)
}

/// Insert statement for `columns`, with an `ON CONFLICT` clause on the
/// table's conflict columns when it has any
pub fn upsert_sql(table: &TableDef, columns: &[&str]) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(&table.name),
        names.join(", "),
        placeholders.join(", ")
    );

    let conflict: Vec<&str> = table
        .conflict_columns()
        .into_iter()
        .map(|c| c.name.as_str())
        .collect();
    if conflict.is_empty() {
        return sql;
    }

    let target: Vec<String> = conflict.iter().map(|c| quote_ident(c)).collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !conflict.contains(*c))
        .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
        .collect();

    if updates.is_empty() {
        sql.push_str(&format!(" ON CONFLICT({}) DO NOTHING", target.join(", ")));
    } else {
        sql.push_str(&format!(
            " ON CONFLICT({}) DO UPDATE SET {}",
            target.join(", "),
            updates.join(", ")
        ));
    }
    sql
}

/// Bind one value as the next positional parameter
pub fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Boolean(b) => query.bind(*b),
        Value::Integer(i) => query.bind(*i),
        Value::Float(x) => query.bind(*x),
        Value::Text(s) => query.bind(s.clone()),
        Value::Date(d) => query.bind(*d),
        Value::Timestamp(ts) => query.bind(*ts),
    }
}
