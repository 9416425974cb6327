use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::error::{Error, Result};
use crate::secrets::CredentialBundle;

pub const APPLICATION_NAME: &str = "pg-graphql-lambda";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub require_tls: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 2,
            acquire_timeout: Duration::from_secs(10),
            require_tls: true,
        }
    }
}

/// Owns the single pool of an execution environment.
#[derive(Default)]
pub struct ConnectionManager {
    pool: OnceLock<PgPool>,
    constructed: AtomicUsize,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    // The pool is lazy: no connection is attempted until the first query, so
    // an unreachable database shows up as a per-request failure.
    pub fn open_pool(
        &self,
        credentials: &CredentialBundle,
        database_name: &str,
        settings: &PoolSettings,
    ) -> Result<PgPool> {
        if let Some(pool) = self.pool.get() {
            return Ok(pool.clone());
        }
        if database_name.is_empty() || credentials.host.is_empty() || credentials.username.is_empty() {
            return Err(Error::configuration(
                "cannot open a pool without host, user and database name",
            ));
        }

        let pool = self.pool.get_or_init(|| {
            self.constructed.fetch_add(1, Ordering::SeqCst);
            info!(
                host = %credentials.host,
                port = credentials.port,
                database = database_name,
                max_connections = settings.max_connections,
                require_tls = settings.require_tls,
                "constructing backing-store pool"
            );
            PgPoolOptions::new()
                .max_connections(settings.max_connections)
                .acquire_timeout(settings.acquire_timeout)
                .connect_lazy_with(connect_options(credentials, database_name, settings))
        });
        Ok(pool.clone())
    }

    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.get()
    }

    /// How many pools this manager has built (never more than one).
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }
}

fn connect_options(
    credentials: &CredentialBundle,
    database_name: &str,
    settings: &PoolSettings,
) -> PgConnectOptions {
    let ssl_mode = if settings.require_tls {
        PgSslMode::Require
    } else {
        PgSslMode::Prefer
    };
    PgConnectOptions::new()
        .host(&credentials.host)
        .port(credentials.port)
        .username(&credentials.username)
        .password(&credentials.password)
        .database(database_name)
        .ssl_mode(ssl_mode)
        .application_name(APPLICATION_NAME)
}

pub async fn health_check(pool: &PgPool) -> Result<bool> {
    let row = sqlx::query("SELECT 1 AS health").fetch_one(pool).await?;
    let health: i32 = row.try_get("health")?;
    Ok(health == 1)
}
