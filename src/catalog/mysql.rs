//! MySQL catalog queries
//!
//! Binary log enumeration, database/table listing and table structure
//! lookup over a small sqlx pool.

use async_trait::async_trait;
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::{MySqlPool, Row};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{ColumnSchema, SchemaResolver, TableSchema};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// Databases never offered for analysis
pub const SYSTEM_DATABASES: [&str; 4] = ["information_schema", "mysql", "performance_schema", "sys"];

/// Metadata queries against the source server
#[derive(Clone)]
pub struct Catalog {
    pool: MySqlPool,
}

impl Catalog {
    /// Connect a server-level pool (no default database)
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.connect_timeout())
            .connect(&config.url())
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Binary log files, oldest first
    pub async fn binlog_files(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SHOW BINARY LOGS").fetch_all(&self.pool).await?;

        let files: Vec<String> = rows.iter().filter_map(|row| text_column(row, 0)).collect();
        if files.is_empty() {
            return Err(Error::NoBinaryLogs);
        }

        tracing::debug!(count = files.len(), "Listed binary logs");
        Ok(files)
    }

    /// User databases, system schemas excluded
    pub async fn list_databases(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SHOW DATABASES").fetch_all(&self.pool).await?;

        let databases = rows
            .iter()
            .filter_map(|row| {
                let name = text_column(row, 0);
                if name.is_none() {
                    tracing::warn!("Skipping unreadable row in SHOW DATABASES");
                }
                name
            })
            .filter(|name| !SYSTEM_DATABASES.contains(&name.to_lowercase().as_str()))
            .collect();

        Ok(databases)
    }

    /// Tables of the given databases, de-duplicated and sorted
    pub async fn list_tables(&self, databases: &[String]) -> Result<Vec<String>> {
        let mut tables = BTreeSet::new();

        for database in databases {
            let sql = format!("SHOW TABLES FROM `{}`", database.replace('`', "``"));
            let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

            for row in &rows {
                match text_column(row, 0) {
                    Some(table) => {
                        tables.insert(table);
                    }
                    None => tracing::warn!(database = %database, "Skipping unreadable table row"),
                }
            }
        }

        Ok(tables.into_iter().collect())
    }
}

/// Read a text column that some servers report as binary
fn text_column(row: &MySqlRow, idx: usize) -> Option<String> {
    row.try_get::<String, _>(idx).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(idx)
            .ok()
            .map(|b| String::from_utf8_lossy(&b).to_string())
    })
}

/// Schema resolver backed by information_schema, with a per-table cache
pub struct MySqlSchemaResolver {
    pool: MySqlPool,
    cache: RwLock<HashMap<(String, String), Arc<TableSchema>>>,
}

impl MySqlSchemaResolver {
    pub fn new(pool: MySqlPool) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn load(&self, database: &str, table: &str) -> Result<Option<TableSchema>> {
        let rows = sqlx::query(
            "SELECT CAST(COLUMN_NAME AS CHAR), CAST(DATA_TYPE AS CHAR), \
             CAST(COLUMN_TYPE AS CHAR), CAST(IS_NULLABLE AS CHAR), CAST(COLUMN_KEY AS CHAR) \
             FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
             ORDER BY ORDINAL_POSITION",
        )
        .bind(database)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut columns = Vec::with_capacity(rows.len());
        let mut primary_key = Vec::new();
        for row in &rows {
            let name: String = row.try_get(0)?;
            let column_type: String = row.try_get(2)?;
            let key: Option<String> = row.try_get(4)?;

            if key.as_deref() == Some("PRI") {
                primary_key.push(name.clone());
            }

            columns.push(ColumnSchema {
                name,
                data_type: row.try_get(1)?,
                nullable: row.try_get::<String, _>(3)? == "YES",
                unsigned: column_type.to_lowercase().contains("unsigned"),
            });
        }

        Ok(Some(TableSchema {
            database: database.to_string(),
            name: table.to_string(),
            columns,
            primary_key,
        }))
    }
}

#[async_trait]
impl SchemaResolver for MySqlSchemaResolver {
    async fn resolve(&self, database: &str, table: &str) -> Result<Option<Arc<TableSchema>>> {
        let key = (database.to_string(), table.to_string());
        if let Some(schema) = self.cache.read().await.get(&key) {
            return Ok(Some(schema.clone()));
        }

        let Some(schema) = self.load(database, table).await? else {
            return Ok(None);
        };

        tracing::debug!(
            database = %database,
            table = %table,
            columns = schema.columns.len(),
            "Loaded table structure"
        );

        let schema = Arc::new(schema);
        self.cache.write().await.insert(key, schema.clone());
        Ok(Some(schema))
    }
}
