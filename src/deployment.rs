//! Deployment resolution.
//!
//! A deployment map is a JSON object keyed by deployment key:
//!
//! ```json
//! { "main": { "environment": "production", "domainName": "api.example.org" } }
//! ```
//!
//! Resolution is a pure lookup and runs before any secret or network access.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentDescriptor {
    pub key: String,
    pub environment_name: String,
    pub domain_name: String,
}

#[derive(Deserialize)]
struct RawDescriptor {
    #[serde(alias = "environmentName")]
    environment: String,
    #[serde(rename = "domainName", default)]
    domain_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentMap {
    entries: HashMap<String, DeploymentDescriptor>,
}

impl DeploymentMap {
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(Error::configuration("deployment map is empty"));
        }
        let parsed: HashMap<String, RawDescriptor> = serde_json::from_str(raw)
            .map_err(|e| Error::configuration(format!("deployment map is not valid JSON: {e}")))?;

        let mut map = DeploymentMap::default();
        for (key, raw) in parsed {
            map.insert(DeploymentDescriptor {
                key,
                environment_name: raw.environment,
                domain_name: raw.domain_name,
            })?;
        }
        Ok(map)
    }

    pub fn insert(&mut self, descriptor: DeploymentDescriptor) -> Result<()> {
        if descriptor.key.is_empty() {
            return Err(Error::configuration("deployment key must not be empty"));
        }
        if descriptor.environment_name.is_empty() {
            return Err(Error::configuration(format!(
                "deployment '{}' has an empty environment name",
                descriptor.key
            )));
        }
        if self.entries.contains_key(&descriptor.key) {
            return Err(Error::configuration(format!(
                "deployment key '{}' is registered twice",
                descriptor.key
            )));
        }
        self.entries.insert(descriptor.key.clone(), descriptor);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Look up `key` in `map`. Unknown or empty keys are configuration errors.
pub fn resolve(map: &DeploymentMap, key: &str) -> Result<DeploymentDescriptor> {
    if map.is_empty() {
        return Err(Error::configuration("deployment map has no entries"));
    }
    if key.is_empty() {
        return Err(Error::configuration("deployment key is empty"));
    }
    map.entries
        .get(key)
        .cloned()
        .ok_or_else(|| Error::configuration(format!("no matching deployment for key '{key}'")))
}

/// Where the active deployment comes from at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentSource {
    /// Only `STAGE` is known; the descriptor is synthesized from it.
    Stage(String),
    /// A deployment map plus the key selecting one entry. `expected_stage` is
    /// checked against the resolved environment when `STAGE` is also set.
    Mapped {
        map: DeploymentMap,
        key: String,
        expected_stage: Option<String>,
    },
}

impl DeploymentSource {
    pub fn resolve(&self) -> Result<DeploymentDescriptor> {
        match self {
            DeploymentSource::Stage(stage) => {
                if stage.is_empty() {
                    return Err(Error::configuration("STAGE is empty"));
                }
                Ok(DeploymentDescriptor {
                    key: stage.clone(),
                    environment_name: stage.clone(),
                    domain_name: String::new(),
                })
            }
            DeploymentSource::Mapped {
                map,
                key,
                expected_stage,
            } => {
                let descriptor = resolve(map, key)?;
                match expected_stage {
                    Some(stage) if *stage != descriptor.environment_name => {
                        Err(Error::configuration(format!(
                            "deployment '{key}' resolves to environment '{}' but STAGE is '{stage}'",
                            descriptor.environment_name
                        )))
                    }
                    _ => Ok(descriptor),
                }
            }
        }
    }
}
