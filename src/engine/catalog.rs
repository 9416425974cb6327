use async_graphql::SimpleObject;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SimpleObject)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SimpleObject)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableInfo {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|column| column.name == name)
    }
}

/// The relations the engine exposes, either introspected from
/// `information_schema` or loaded from a precomputed schema cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub schema: String,
    pub tables: Vec<TableInfo>,
}

impl Catalog {
    pub async fn introspect(pool: &PgPool, schema: &str) -> Result<Self> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT table_name::text, column_name::text, data_type::text \
             FROM information_schema.columns \
             WHERE table_schema = $1 \
             ORDER BY table_name, ordinal_position",
        )
        .bind(schema)
        .fetch_all(pool)
        .await?;
        Ok(Self::from_columns(schema, rows))
    }

    /// Group `(table, column, type)` rows, which must arrive ordered by table.
    pub fn from_columns<I>(schema: &str, rows: I) -> Self
    where
        I: IntoIterator<Item = (String, String, String)>,
    {
        let mut tables: Vec<TableInfo> = Vec::new();
        for (table, name, data_type) in rows {
            let column = ColumnInfo { name, data_type };
            match tables.last_mut() {
                Some(last) if last.name == table => last.columns.push(column),
                _ => tables.push(TableInfo {
                    name: table,
                    columns: vec![column],
                }),
            }
        }
        Self {
            schema: schema.to_string(),
            tables,
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.iter().find(|table| table.name == name)
    }

    pub fn qualified_name(&self, table: &TableInfo) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&table.name))
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
