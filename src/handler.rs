//! Invocation bridge.
//!
//! Every invocation on an execution environment goes through
//! [`InvocationBridge::handle`]. The first one starts the setup sequence
//! (deployment → credentials → pool → engine); invocations arriving while it
//! runs join the same in-flight setup instead of starting another. A failed
//! setup is replayed to every later invocation until the platform recycles
//! the environment.

use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use futures::future::{BoxFuture, FutureExt, Shared};
use lambda_runtime::LambdaEvent;
use parking_lot::Mutex;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::database::ConnectionManager;
use crate::deployment::DeploymentDescriptor;
use crate::engine::{self, cache, RequestHandler};
use crate::envelope::{InvocationEnvelope, ResponseEnvelope};
use crate::error::Result;
use crate::secrets::{SecretLoader, SecretStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

/// Resources built by a successful setup. Immutable once published.
pub struct Ready {
    pub descriptor: DeploymentDescriptor,
    pub handler: RequestHandler,
}

type SetupFuture = Shared<BoxFuture<'static, Result<Arc<Ready>>>>;

enum Phase {
    Uninitialized,
    Initializing(SetupFuture),
    Ready(Arc<Ready>),
    Failed(crate::Error),
}

/// Process-wide state of one warm execution environment.
pub struct ExecutionEnvironmentState {
    config: RuntimeConfig,
    secrets: SecretLoader,
    connections: ConnectionManager,
    phase: Mutex<Phase>,
}

impl ExecutionEnvironmentState {
    async fn initialize(self: Arc<Self>) -> Result<Arc<Ready>> {
        let started = Instant::now();
        info!("cold start: initializing execution environment");

        let descriptor = self.config.deployment.resolve()?;
        let engine_config = self.config.engine_for(&descriptor);
        info!(
            deployment = %descriptor.key,
            environment = %descriptor.environment_name,
            explorer = engine_config.explorer_enabled,
            "deployment resolved"
        );

        let credentials = self
            .secrets
            .load_credentials(self.config.credentials.secret_id(), &descriptor.environment_name)
            .await?;
        let pool = self
            .connections
            .open_pool(&credentials, &credentials.database_name, &self.config.pool)?;

        let catalog = cache::load_schema_cache(
            engine_config.schema_cache_source.as_ref(),
            &engine_config.schema,
            engine_config.schema_cache_timeout,
        )
        .await?;
        let handler =
            engine::build_handler(pool, &engine_config, catalog, &credentials.license_token)?;

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "execution environment ready"
        );
        Ok(Arc::new(Ready {
            descriptor,
            handler,
        }))
    }
}

#[derive(Clone)]
pub struct InvocationBridge {
    env: Arc<ExecutionEnvironmentState>,
}

impl InvocationBridge {
    pub fn new(config: RuntimeConfig, store: Arc<dyn SecretStore>) -> Self {
        Self {
            env: Arc::new(ExecutionEnvironmentState {
                config,
                secrets: SecretLoader::new(store),
                connections: ConnectionManager::new(),
                phase: Mutex::new(Phase::Uninitialized),
            }),
        }
    }

    pub fn phase(&self) -> InitPhase {
        match &*self.env.phase.lock() {
            Phase::Uninitialized => InitPhase::Uninitialized,
            Phase::Initializing(_) => InitPhase::Initializing,
            Phase::Ready(_) => InitPhase::Ready,
            Phase::Failed(_) => InitPhase::Failed,
        }
    }

    pub fn secret_fetches(&self) -> usize {
        self.env.secrets.fetch_count()
    }

    pub fn pools_constructed(&self) -> usize {
        self.env.connections.constructed()
    }

    /// Wait for the environment to be ready, starting setup if nobody has.
    pub async fn ready(&self) -> Result<Arc<Ready>> {
        let setup = {
            let mut phase = self.env.phase.lock();
            match &*phase {
                Phase::Ready(ready) => return Ok(Arc::clone(ready)),
                Phase::Failed(err) => return Err(err.clone()),
                Phase::Initializing(setup) => setup.clone(),
                Phase::Uninitialized => {
                    let setup = Arc::clone(&self.env).initialize().boxed().shared();
                    *phase = Phase::Initializing(setup.clone());
                    setup
                }
            }
        };

        let outcome = setup.await;

        let mut phase = self.env.phase.lock();
        if matches!(*phase, Phase::Initializing(_)) {
            *phase = match &outcome {
                Ok(ready) => Phase::Ready(Arc::clone(ready)),
                Err(err) => {
                    error!(error = %err, kind = err.kind(), "execution environment failed to initialize");
                    Phase::Failed(err.clone())
                }
            };
        }
        outcome
    }

    /// Serve one invocation. Setup failures are returned as errors; anything
    /// that goes wrong with this request alone becomes an error response.
    pub async fn handle(&self, envelope: InvocationEnvelope) -> Result<ResponseEnvelope> {
        let ready = self.ready().await?;

        let method = envelope.http_method.clone();
        let path = envelope.path.clone().unwrap_or_default();
        let request = match envelope.into_request() {
            Ok(request) => request,
            Err(err) => {
                warn!(%method, %path, error = %err, "rejecting malformed invocation");
                return Ok(ResponseEnvelope::from_error(StatusCode::BAD_REQUEST, &err));
            }
        };

        let response = match ready.handler.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };
        let status = response.status();

        match ResponseEnvelope::from_response(response).await {
            Ok(envelope) => {
                debug!(%method, %path, status = status.as_u16(), "invocation served");
                Ok(envelope)
            }
            Err(err) => {
                warn!(%method, %path, error = %err, "engine response could not be translated");
                Ok(ResponseEnvelope::from_error(StatusCode::BAD_GATEWAY, &err))
            }
        }
    }
}

// Lambda entry point for one invocation
pub async fn function_handler(
    bridge: &InvocationBridge,
    event: LambdaEvent<InvocationEnvelope>,
) -> Result<ResponseEnvelope> {
    debug!(request_id = %event.context.request_id, "invocation received");
    bridge.handle(event.payload).await
}
