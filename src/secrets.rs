//! Credential loading from the managed secret store.
//!
//! The secret payload is a JSON object carrying the backing-store credentials
//! and the engine licence. It is fetched at most once per execution
//! environment; concurrent callers join the fetch already in flight.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use aws_sdk_secretsmanager::error::DisplayErrorContext;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const DB_HOST: &str = "DB_HOST";
pub const PORT: &str = "PORT";
pub const DB_USER: &str = "DB_USER";
pub const DB_PASSWORD: &str = "DB_PASSWORD";
pub const GRAPHILE_LICENSE: &str = "GRAPHILE_LICENSE";

pub const REQUIRED_KEYS: [&str; 5] = [DB_HOST, PORT, DB_USER, DB_PASSWORD, GRAPHILE_LICENSE];

#[derive(Clone, PartialEq, Eq)]
pub struct CredentialBundle {
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub username: String,
    pub password: String,
    pub license_token: String,
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_name", &self.database_name)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("license_token", &"<redacted>")
            .finish()
    }
}

impl CredentialBundle {
    /// Parse a secret payload. Error messages name keys, never values.
    pub fn from_secret_json(payload: &str, database_name: &str) -> Result<Self> {
        if database_name.trim().is_empty() {
            return Err(Error::configuration("backing-store database name is empty"));
        }

        let fields: Map<String, Value> = serde_json::from_str(payload).map_err(|e| {
            Error::SecretFormat(format!(
                "secret payload is not a JSON object ({:?} error at line {} column {})",
                e.classify(),
                e.line(),
                e.column()
            ))
        })?;

        let port = required_field(&fields, PORT)?;
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| Error::SecretFormat(format!("{PORT} is not a valid port number")))?;

        Ok(Self {
            host: required_field(&fields, DB_HOST)?,
            port,
            database_name: database_name.to_string(),
            username: required_field(&fields, DB_USER)?,
            password: required_field(&fields, DB_PASSWORD)?,
            license_token: required_field(&fields, GRAPHILE_LICENSE)?,
        })
    }
}

fn required_field(fields: &Map<String, Value>, key: &str) -> Result<String> {
    let value = match fields.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    if value.is_empty() {
        return Err(Error::SecretFormat(format!(
            "required key {key} is missing or empty"
        )));
    }
    Ok(value)
}

/// A source of secret payloads keyed by secret identifier.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// `Ok(None)` means the secret exists but carries no string payload.
    async fn get_secret_string(&self, secret_id: &str) -> Result<Option<String>>;
}

pub struct SecretsManagerStore {
    client: aws_sdk_secretsmanager::Client,
}

impl SecretsManagerStore {
    pub fn new(client: aws_sdk_secretsmanager::Client) -> Self {
        Self { client }
    }

    /// Build a client from the default AWS provider chain (region and role
    /// come from the Lambda environment). No network I/O happens here.
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(aws_sdk_secretsmanager::Client::new(&config))
    }
}

#[async_trait]
impl SecretStore for SecretsManagerStore {
    async fn get_secret_string(&self, secret_id: &str) -> Result<Option<String>> {
        let output = self
            .client
            .get_secret_value()
            .secret_id(secret_id)
            .send()
            .await
            .map_err(|e| Error::SecretUnavailable(format!("{}", DisplayErrorContext(&e))))?;
        Ok(output.secret_string().map(str::to_owned))
    }
}

/// Externally managed variant: the deployment injects credential values
/// directly into the environment. They are re-serialized as a secret payload
/// so they go through the same validation as a fetched secret.
#[derive(Clone, Default)]
pub struct EnvironmentStore {
    values: BTreeMap<String, String>,
}

impl fmt::Debug for EnvironmentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentStore")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EnvironmentStore {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut values = BTreeMap::new();
        for key in REQUIRED_KEYS {
            let value = match key {
                PORT => lookup(PORT).or_else(|| lookup("DB_PORT")),
                _ => lookup(key),
            };
            if let Some(value) = value {
                values.insert(key.to_string(), value);
            }
        }
        Self { values }
    }
}

#[async_trait]
impl SecretStore for EnvironmentStore {
    async fn get_secret_string(&self, _secret_id: &str) -> Result<Option<String>> {
        serde_json::to_string(&self.values)
            .map(Some)
            .map_err(|e| Error::SecretFormat(format!("cannot encode environment credentials: {e}")))
    }
}

/// Memoizes one credential fetch for the lifetime of an execution environment.
pub struct SecretLoader {
    store: Arc<dyn SecretStore>,
    cached: OnceCell<Result<Arc<CredentialBundle>>>,
    fetches: AtomicUsize,
}

impl SecretLoader {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            cached: OnceCell::new(),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Resolve credentials, joining any fetch already in flight. The outcome,
    /// success or failure, is kept until the environment is recycled.
    pub async fn load_credentials(
        &self,
        secret_id: &str,
        database_name: &str,
    ) -> Result<Arc<CredentialBundle>> {
        self.cached
            .get_or_init(|| self.fetch(secret_id, database_name))
            .await
            .clone()
    }

    /// Number of round trips made to the secret store.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    async fn fetch(&self, secret_id: &str, database_name: &str) -> Result<Arc<CredentialBundle>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        debug!(secret_id, "fetching credentials from secret store");

        let outcome = match self.store.get_secret_string(secret_id).await {
            Ok(Some(payload)) => CredentialBundle::from_secret_json(&payload, database_name),
            Ok(None) => Err(Error::SecretFormat("secret has no string payload".to_string())),
            Err(err) => Err(err),
        };

        match &outcome {
            Ok(bundle) => info!(
                secret_id,
                host = %bundle.host,
                database = %bundle.database_name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "credentials loaded"
            ),
            Err(err) => warn!(secret_id, error = %err, "credential load failed"),
        }
        outcome.map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn payload() -> Value {
        serde_json::json!({
            "DB_HOST": "db.internal",
            "PORT": "5432",
            "DB_USER": "api",
            "DB_PASSWORD": "hunter2",
            "GRAPHILE_LICENSE": "lic-123",
        })
    }

    struct CountingStore {
        payload: Option<String>,
    }

    #[async_trait]
    impl SecretStore for CountingStore {
        async fn get_secret_string(&self, _secret_id: &str) -> Result<Option<String>> {
            tokio::task::yield_now().await;
            Ok(self.payload.clone())
        }
    }

    #[test]
    fn parses_complete_payload() {
        let bundle = CredentialBundle::from_secret_json(&payload().to_string(), "dev").unwrap();
        assert_eq!(bundle.host, "db.internal");
        assert_eq!(bundle.port, 5432);
        assert_eq!(bundle.database_name, "dev");
        assert_eq!(bundle.license_token, "lic-123");
    }

    #[test]
    fn numeric_port_is_accepted() {
        let mut value = payload();
        value["PORT"] = serde_json::json!(6543);
        let bundle = CredentialBundle::from_secret_json(&value.to_string(), "dev").unwrap();
        assert_eq!(bundle.port, 6543);
    }

    #[test]
    fn each_missing_key_is_a_format_error() {
        for key in REQUIRED_KEYS {
            let mut value = payload();
            value.as_object_mut().unwrap().remove(key);
            let err = CredentialBundle::from_secret_json(&value.to_string(), "dev").unwrap_err();
            assert!(matches!(err, Error::SecretFormat(ref msg) if msg.contains(key)), "{key}: {err}");
        }
    }

    #[test]
    fn empty_values_and_bad_ports_are_rejected() {
        let mut value = payload();
        value["DB_USER"] = serde_json::json!("  ");
        assert!(matches!(
            CredentialBundle::from_secret_json(&value.to_string(), "dev"),
            Err(Error::SecretFormat(_))
        ));

        let mut value = payload();
        value["PORT"] = serde_json::json!("0");
        assert!(matches!(
            CredentialBundle::from_secret_json(&value.to_string(), "dev"),
            Err(Error::SecretFormat(_))
        ));
    }

    #[test]
    fn errors_never_echo_secret_values() {
        let err = CredentialBundle::from_secret_json("\"hunter2\"", "dev").unwrap_err();
        assert!(matches!(err, Error::SecretFormat(_)));
        assert!(!err.to_string().contains("hunter2"));

        let bundle = CredentialBundle::from_secret_json(&payload().to_string(), "dev").unwrap();
        let debug = format!("{bundle:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("lic-123"));
    }

    #[tokio::test]
    async fn environment_store_accepts_db_port_alias() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DB_HOST", "db.internal"),
            ("DB_PORT", "5432"),
            ("DB_USER", "api"),
            ("DB_PASSWORD", "hunter2"),
            ("GRAPHILE_LICENSE", "lic-123"),
        ]);
        let store = EnvironmentStore::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert!(!format!("{store:?}").contains("hunter2"));

        let payload = store.get_secret_string("environment").await.unwrap().unwrap();
        let bundle = CredentialBundle::from_secret_json(&payload, "dev").unwrap();
        assert_eq!(bundle.port, 5432);
    }

    #[tokio::test]
    async fn concurrent_loads_share_one_fetch() {
        let loader = SecretLoader::new(Arc::new(CountingStore {
            payload: Some(payload().to_string()),
        }));

        let (a, b) = tokio::join!(
            loader.load_credentials("arn:secret", "dev"),
            loader.load_credentials("arn:secret", "dev"),
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(loader.fetch_count(), 1);
    }

    #[tokio::test]
    async fn missing_payload_failure_is_memoized() {
        let loader = SecretLoader::new(Arc::new(CountingStore { payload: None }));

        for _ in 0..3 {
            assert!(matches!(
                loader.load_credentials("arn:secret", "dev").await,
                Err(Error::SecretFormat(_))
            ));
        }
        assert_eq!(loader.fetch_count(), 1);
    }
}
