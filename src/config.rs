//! Runtime configuration, read once per execution environment from the
//! variables the deployment sets on the function.

use std::str::FromStr;
use std::time::Duration;

use crate::database::PoolSettings;
use crate::deployment::{DeploymentDescriptor, DeploymentMap, DeploymentSource};
use crate::engine::cache::SchemaCacheSource;
use crate::engine::EngineConfig;
use crate::error::{Error, Result};

pub const DEFAULT_SCHEMA: &str = "main";
pub const EXPLORER_STAGE: &str = "dev";
const MAX_POOL_CONNECTIONS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Fetch the credential bundle from AWS Secrets Manager.
    SecretsManager { secret_id: String },
    /// Credentials were injected into the environment by the deployment.
    Environment,
}

impl CredentialSource {
    pub fn secret_id(&self) -> &str {
        match self {
            CredentialSource::SecretsManager { secret_id } => secret_id,
            CredentialSource::Environment => "environment",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub deployment: DeploymentSource,
    pub credentials: CredentialSource,
    pub pool: PoolSettings,
    pub engine: EngineConfig,
    /// Explicit explorer switch; when unset the explorer follows the stage.
    pub explorer_override: Option<bool>,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let stage = vars.get("STAGE");

        let deployment = match (vars.get("DEPLOYMENT_MAP"), vars.get("DEPLOYMENT_KEY")) {
            (Some(map), Some(key)) => DeploymentSource::Mapped {
                map: DeploymentMap::from_json(&map)?,
                key,
                expected_stage: stage,
            },
            (None, None) => DeploymentSource::Stage(
                stage.ok_or_else(|| Error::configuration("STAGE is not set"))?,
            ),
            _ => {
                return Err(Error::configuration(
                    "DEPLOYMENT_MAP and DEPLOYMENT_KEY must be set together",
                ))
            }
        };

        let credentials = match vars.get("CREDENTIAL_SOURCE").as_deref() {
            None | Some("secrets-manager") => CredentialSource::SecretsManager {
                secret_id: vars
                    .get("SECRET_ARN")
                    .or_else(|| vars.get("SECRET_ID"))
                    .ok_or_else(|| Error::configuration("SECRET_ARN is not set"))?,
            },
            Some("environment") => CredentialSource::Environment,
            Some(other) => {
                return Err(Error::configuration(format!(
                    "unknown CREDENTIAL_SOURCE '{other}'"
                )))
            }
        };

        let defaults = PoolSettings::default();
        let pool = PoolSettings {
            max_connections: vars
                .parse::<u32>("DB_POOL_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections)
                .clamp(1, MAX_POOL_CONNECTIONS),
            acquire_timeout: vars
                .parse::<u64>("DB_ACQUIRE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
            require_tls: vars.flag("DB_REQUIRE_TLS")?.unwrap_or(defaults.require_tls),
        };

        let engine_defaults = EngineConfig::default();
        // A negative cap means "no cap"
        let pagination_cap = match vars.parse::<i64>("GRAPHQL_PAGINATION_CAP")? {
            Some(cap) if cap < 0 => None,
            Some(cap) => Some(u32::try_from(cap).map_err(|_| {
                Error::configuration("GRAPHQL_PAGINATION_CAP is out of range")
            })?),
            None => engine_defaults.pagination_cap,
        };
        let engine = EngineConfig {
            schema: vars.get("DB_SCHEMA").unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
            enable_cors: vars.flag("GRAPHQL_ENABLE_CORS")?.unwrap_or(engine_defaults.enable_cors),
            explorer_enabled: false,
            depth_limit: vars
                .parse::<usize>("GRAPHQL_DEPTH_LIMIT")?
                .or(engine_defaults.depth_limit),
            cost_limit: vars
                .parse::<usize>("GRAPHQL_COST_LIMIT")?
                .or(engine_defaults.cost_limit),
            pagination_cap,
            disable_default_mutations: vars
                .flag("GRAPHQL_DISABLE_DEFAULT_MUTATIONS")?
                .unwrap_or(engine_defaults.disable_default_mutations),
            schema_cache_source: vars
                .get("SCHEMA_CACHE_SOURCE")
                .map(|raw| SchemaCacheSource::parse(&raw))
                .transpose()?,
            schema_cache_timeout: vars
                .parse::<u64>("SCHEMA_CACHE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(engine_defaults.schema_cache_timeout),
        };
        engine.validate()?;

        Ok(Self {
            deployment,
            credentials,
            pool,
            engine,
            explorer_override: vars.flag("GRAPHQL_EXPLORER")?,
        })
    }

    /// Engine configuration for the resolved deployment.
    pub fn engine_for(&self, descriptor: &DeploymentDescriptor) -> EngineConfig {
        EngineConfig {
            explorer_enabled: self
                .explorer_override
                .unwrap_or_else(|| explorer_default(&descriptor.environment_name)),
            ..self.engine.clone()
        }
    }
}

/// The explorer is only exposed on the development stage.
pub fn explorer_default(stage: &str) -> bool {
    stage == EXPLORER_STAGE
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    // Unset and blank variables are treated alike
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>> {
        self.get(name)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|_| Error::configuration(format!("{name} has an invalid value '{raw}'")))
            })
            .transpose()
    }

    fn flag(&self, name: &str) -> Result<Option<bool>> {
        match self.get(name).map(|raw| raw.to_lowercase()).as_deref() {
            None => Ok(None),
            Some("true" | "1" | "yes" | "on") => Ok(Some(true)),
            Some("false" | "0" | "no" | "off") => Ok(Some(false)),
            Some(other) => Err(Error::configuration(format!(
                "{name} must be a boolean, got '{other}'"
            ))),
        }
    }
}
