use std::sync::Arc;

use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use pg_graphql_lambda::logging::init_structured_logging;
use pg_graphql_lambda::secrets::{EnvironmentStore, SecretStore, SecretsManagerStore};
use pg_graphql_lambda::{function_handler, CredentialSource, InvocationBridge, InvocationEnvelope, RuntimeConfig};

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_structured_logging();

    // Configuration problems abort the cold start before anything is fetched
    let config = RuntimeConfig::from_env()?;

    let store: Arc<dyn SecretStore> = match &config.credentials {
        CredentialSource::SecretsManager { .. } => Arc::new(SecretsManagerStore::from_env().await),
        CredentialSource::Environment => Arc::new(EnvironmentStore::from_env()),
    };
    let bridge = InvocationBridge::new(config, store);
    let bridge = &bridge;

    run(service_fn(move |event: LambdaEvent<InvocationEnvelope>| async move {
        function_handler(bridge, event).await
    }))
    .await
}
