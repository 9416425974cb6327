//! The embedded GraphQL engine.
//!
//! Exposes the relations of one Postgres schema as simple list collections:
//!
//! ```graphql
//! query {
//!   tables { name columns { name dataType } }
//!   rows(table: "cases", first: 20, offset: 40)
//! }
//! ```
//!
//! `insertRow` is only served when default mutations are enabled.

use std::sync::Arc;

use async_graphql::{Context, EmptySubscription, Json, Object, Schema};
use serde_json::{Map, Value};
use sqlx::PgPool;
use tokio::sync::OnceCell;
use tracing::warn;

use super::catalog::{quote_ident, Catalog, TableInfo};
use super::EngineConfig;
use crate::database;
use crate::envelope::InvocationContext;
use crate::error::Error;

pub type EngineSchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

pub struct EngineContext {
    pool: PgPool,
    schema: String,
    pagination_cap: Option<u32>,
    mutations_enabled: bool,
    catalog: OnceCell<Arc<Catalog>>,
}

impl EngineContext {
    pub fn new(pool: PgPool, config: &EngineConfig, catalog: Option<Catalog>) -> Self {
        Self {
            pool,
            schema: config.schema.clone(),
            pagination_cap: config.pagination_cap,
            mutations_enabled: !config.disable_default_mutations,
            catalog: OnceCell::new_with(catalog.map(Arc::new)),
        }
    }

    // Introspection failures are not memoized; the next query retries.
    async fn catalog(&self) -> async_graphql::Result<Arc<Catalog>> {
        self.catalog
            .get_or_try_init(|| async {
                Catalog::introspect(&self.pool, &self.schema).await.map(Arc::new)
            })
            .await
            .map(Arc::clone)
            .map_err(request_error)
    }

    async fn table(&self, name: &str) -> async_graphql::Result<(Arc<Catalog>, TableInfo)> {
        let catalog = self.catalog().await?;
        let table = catalog
            .table(name)
            .cloned()
            .ok_or_else(|| async_graphql::Error::new(format!("unknown table '{name}'")))?;
        Ok((catalog, table))
    }
}

fn request_error(err: Error) -> async_graphql::Error {
    warn!(error = %err, kind = err.kind(), "engine request failed");
    async_graphql::Error::new(err.to_string())
}

fn backing_store(err: sqlx::Error) -> async_graphql::Error {
    request_error(Error::from(err))
}

/// Effective page size: the requested size clamped by the cap, if any.
/// `None` means unbounded.
pub fn page_limit(first: Option<i32>, cap: Option<u32>) -> Result<Option<i64>, String> {
    let requested = match first {
        Some(n) if n < 0 => return Err("first must not be negative".to_string()),
        Some(n) => Some(i64::from(n)),
        None => None,
    };
    let cap = cap.map(i64::from);
    Ok(match (requested, cap) {
        (Some(requested), Some(cap)) => Some(requested.min(cap)),
        (requested, cap) => requested.or(cap),
    })
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    /// True when the backing store answers a trivial query.
    async fn health(&self, ctx: &Context<'_>) -> async_graphql::Result<bool> {
        let engine = ctx.data::<EngineContext>()?;
        database::health_check(&engine.pool)
            .await
            .map_err(request_error)
    }

    /// Gateway request id of the invocation being served, when known.
    async fn request_id(&self, ctx: &Context<'_>) -> Option<String> {
        ctx.data_opt::<InvocationContext>()
            .and_then(|context| context.0.get("requestId"))
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    /// Relations exposed by this API.
    async fn tables(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<TableInfo>> {
        let engine = ctx.data::<EngineContext>()?;
        Ok(engine.catalog().await?.tables.clone())
    }

    /// One page of rows from `table`, as JSON objects.
    async fn rows(
        &self,
        ctx: &Context<'_>,
        table: String,
        first: Option<i32>,
        #[graphql(default)] offset: i32,
    ) -> async_graphql::Result<Json<Value>> {
        let engine = ctx.data::<EngineContext>()?;
        if offset < 0 {
            return Err("offset must not be negative".into());
        }
        let limit = page_limit(first, engine.pagination_cap)?;
        let (catalog, table) = engine.table(&table).await?;

        let sql = format!(
            "SELECT COALESCE(json_agg(to_json(r)), '[]'::json) \
             FROM (SELECT * FROM {} LIMIT $1 OFFSET $2) r",
            catalog.qualified_name(&table)
        );
        let rows: Value = sqlx::query_scalar(&sql)
            .bind(limit)
            .bind(i64::from(offset))
            .fetch_one(&engine.pool)
            .await
            .map_err(backing_store)?;
        Ok(Json(rows))
    }
}

fn mutations_visible(ctx: &Context<'_>) -> bool {
    ctx.data::<EngineContext>()
        .map(|engine| engine.mutations_enabled)
        .unwrap_or(false)
}

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    /// Insert one row into `table` and return it as stored.
    #[graphql(visible = "mutations_visible")]
    async fn insert_row(
        &self,
        ctx: &Context<'_>,
        table: String,
        values: Json<Map<String, Value>>,
    ) -> async_graphql::Result<Json<Value>> {
        let engine = ctx.data::<EngineContext>()?;
        if !engine.mutations_enabled {
            return Err("default mutations are disabled".into());
        }
        let (catalog, table) = engine.table(&table).await?;
        let values = values.0;
        if values.is_empty() {
            return Err("values must name at least one column".into());
        }
        if let Some(unknown) = values.keys().find(|column| !table.has_column(column)) {
            return Err(format!("unknown column '{unknown}' on table '{}'", table.name).into());
        }

        let target = catalog.qualified_name(&table);
        let columns = values
            .keys()
            .map(|column| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {target} AS r ({columns}) \
             SELECT {columns} FROM json_populate_record(NULL::{target}, $1::json) \
             RETURNING to_json(r)"
        );
        let row: Value = sqlx::query_scalar(&sql)
            .bind(sqlx::types::Json(Value::Object(values)))
            .fetch_one(&engine.pool)
            .await
            .map_err(backing_store)?;
        Ok(Json(row))
    }
}

/// Build the executable schema with the configured ceilings applied.
pub fn build_schema(pool: PgPool, config: &EngineConfig, catalog: Option<Catalog>) -> EngineSchema {
    let mut builder = Schema::build(QueryRoot, MutationRoot, EmptySubscription)
        .data(EngineContext::new(pool, config, catalog));
    if let Some(depth) = config.depth_limit {
        builder = builder.limit_depth(depth);
    }
    if let Some(cost) = config.cost_limit {
        builder = builder.limit_complexity(cost);
    }
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_limit_applies_cap() {
        assert_eq!(page_limit(None, None), Ok(None));
        assert_eq!(page_limit(Some(50), None), Ok(Some(50)));
        assert_eq!(page_limit(None, Some(100)), Ok(Some(100)));
        assert_eq!(page_limit(Some(500), Some(100)), Ok(Some(100)));
        assert_eq!(page_limit(Some(10), Some(100)), Ok(Some(10)));
        assert!(page_limit(Some(-1), Some(100)).is_err());
    }
}
