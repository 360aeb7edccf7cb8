//! Catalog Module
//!
//! Server metadata: binary log enumeration, database/table listing and
//! table structure lookup for row events.

pub mod ddl;
mod mysql;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

pub use ddl::{is_ddl, parse_ddl, DdlKind, DdlStatement};
pub use mysql::{Catalog, MySqlSchemaResolver, SYSTEM_DATABASES};

/// Table structure as seen by the SQL renderer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub database: String,
    pub name: String,
    /// Columns in ordinal order
    pub columns: Vec<ColumnSchema>,
    /// Primary key column names, empty if the table has none
    pub primary_key: Vec<String>,
}

/// Column schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    /// Base type, e.g. `int`, `varchar`
    pub data_type: String,
    pub nullable: bool,
    pub unsigned: bool,
}

impl TableSchema {
    /// Ordinal positions of the primary key columns
    pub fn primary_key_positions(&self) -> Vec<usize> {
        self.primary_key
            .iter()
            .filter_map(|pk| self.columns.iter().position(|c| &c.name == pk))
            .collect()
    }

    pub fn column(&self, idx: usize) -> Option<&ColumnSchema> {
        self.columns.get(idx)
    }
}

/// Looks up table structure by database and table name
#[async_trait]
pub trait SchemaResolver: Send + Sync {
    /// `Ok(None)` means the table does not exist (any more)
    async fn resolve(&self, database: &str, table: &str) -> Result<Option<Arc<TableSchema>>>;
}

/// Resolver over a fixed set of tables
#[derive(Debug, Default, Clone)]
pub struct StaticSchemaResolver {
    tables: HashMap<(String, String), Arc<TableSchema>>,
}

impl StaticSchemaResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, schema: TableSchema) -> Self {
        self.insert(schema);
        self
    }

    pub fn insert(&mut self, schema: TableSchema) {
        self.tables.insert(
            (schema.database.clone(), schema.name.clone()),
            Arc::new(schema),
        );
    }
}

#[async_trait]
impl SchemaResolver for StaticSchemaResolver {
    async fn resolve(&self, database: &str, table: &str) -> Result<Option<Arc<TableSchema>>> {
        Ok(self
            .tables
            .get(&(database.to_string(), table.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> TableSchema {
        TableSchema {
            database: "shop".into(),
            name: "orders".into(),
            columns: vec![
                ColumnSchema {
                    name: "note".into(),
                    data_type: "varchar".into(),
                    nullable: true,
                    unsigned: false,
                },
                ColumnSchema {
                    name: "id".into(),
                    data_type: "int".into(),
                    nullable: false,
                    unsigned: true,
                },
            ],
            primary_key: vec!["id".into()],
        }
    }

    #[test]
    fn test_primary_key_positions() {
        assert_eq!(orders().primary_key_positions(), vec![1]);
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticSchemaResolver::new().with_table(orders());
        assert!(resolver.resolve("shop", "orders").await.unwrap().is_some());
        assert!(resolver.resolve("shop", "gone").await.unwrap().is_none());
    }
}
