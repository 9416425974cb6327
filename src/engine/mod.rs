//! Request-processing engine adapter.
//!
//! Translates [`EngineConfig`] into the shape the GraphQL engine and its HTTP
//! surface expect and hands back a ready-to-serve [`RequestHandler`].

pub mod cache;
pub mod catalog;
pub mod schema;

use std::time::Duration;

use async_graphql::http::GraphiQLSource;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};

use self::cache::SchemaCacheSource;
use self::catalog::Catalog;
pub use self::schema::{build_schema, EngineSchema};
use crate::envelope::InvocationContext;
use crate::error::{Error, Result};

pub const GRAPHQL_ROUTE: &str = "/graphql";
pub const EXPLORER_ROUTE: &str = "/graphiql";

/// The per-environment request handler: a cloneable tower service.
pub type RequestHandler = Router;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Postgres schema whose relations are exposed.
    pub schema: String,
    pub enable_cors: bool,
    pub explorer_enabled: bool,
    pub depth_limit: Option<usize>,
    pub cost_limit: Option<usize>,
    pub pagination_cap: Option<u32>,
    pub disable_default_mutations: bool,
    pub schema_cache_source: Option<SchemaCacheSource>,
    /// Upper bound on fetching the schema cache over HTTP.
    pub schema_cache_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema: "main".to_string(),
            enable_cors: true,
            explorer_enabled: false,
            depth_limit: Some(50_000),
            cost_limit: Some(50_000),
            pagination_cap: None,
            disable_default_mutations: true,
            schema_cache_source: None,
            schema_cache_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.schema.trim().is_empty() {
            return Err(Error::configuration("engine schema name is empty"));
        }
        if self.depth_limit == Some(0) || self.cost_limit == Some(0) {
            return Err(Error::configuration("query ceilings must be positive"));
        }
        Ok(())
    }
}

/// `license` is the engine licence token from the credential bundle. It gates
/// the handler and is never logged.
pub fn build_handler(
    pool: PgPool,
    config: &EngineConfig,
    catalog: Option<Catalog>,
    license: &str,
) -> Result<RequestHandler> {
    if license.trim().is_empty() {
        return Err(Error::configuration("engine licence token is empty"));
    }
    config.validate()?;
    let schema = build_schema(pool, config, catalog);

    let mut router = Router::new().route(GRAPHQL_ROUTE, get(graphql).post(graphql));
    if config.explorer_enabled {
        router = router.route(EXPLORER_ROUTE, get(explorer));
    }
    let mut router = router.fallback(not_found).with_state(schema);
    if config.enable_cors {
        router = router.layer(cors_layer());
    }
    Ok(router)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

// GET reads the operation from the body when one is sent, otherwise from the
// query string; POST always carries a JSON body. The gateway request context
// rides along as request data for resolvers.
async fn graphql(State(schema): State<EngineSchema>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };
    let context = parts.extensions.get::<InvocationContext>().cloned();

    let request = if !body.is_empty() {
        serde_json::from_slice::<async_graphql::Request>(&body).map_err(|e| e.to_string())
    } else if let Some(query) = parts.uri.query() {
        async_graphql::http::parse_query_string(query).map_err(|e| e.to_string())
    } else {
        Err("request carries no GraphQL operation".to_string())
    };

    let mut request = match request {
        Ok(request) => request,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };
    if let Some(context) = context {
        request = request.data(context);
    }

    let response = schema.execute(request).await;
    match serde_json::to_string(&response) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn explorer() -> Html<String> {
    Html(GraphiQLSource::build().endpoint(GRAPHQL_ROUTE).finish())
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "not found")
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({ "errors": [{ "message": message }] });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use sqlx::postgres::PgPoolOptions;
    use tower::ServiceExt;

    const LICENSE: &str = "lic-123";

    fn lazy_pool() -> PgPool {
        PgPoolOptions::new()
            .connect_lazy("postgres://api@db.invalid/dev")
            .unwrap()
    }

    fn cached_catalog() -> Catalog {
        Catalog::from_columns(
            "main",
            vec![
                ("cases".into(), "id".into(), "integer".into()),
                ("cases".into(), "title".into(), "text".into()),
            ],
        )
    }

    async fn send(router: RequestHandler, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    fn post(query: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(GRAPHQL_ROUTE)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::json!({ "query": query }).to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn explorer_is_gated() {
        let enabled = EngineConfig {
            explorer_enabled: true,
            ..EngineConfig::default()
        };
        let router = build_handler(lazy_pool(), &enabled, None, LICENSE).unwrap();
        let request = Request::get(EXPLORER_ROUTE).body(Body::empty()).unwrap();
        assert_eq!(router.oneshot(request).await.unwrap().status(), StatusCode::OK);

        let router = build_handler(lazy_pool(), &EngineConfig::default(), None, LICENSE).unwrap();
        let request = Request::get(EXPLORER_ROUTE).body(Body::empty()).unwrap();
        assert_eq!(router.oneshot(request).await.unwrap().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn query_string_operations_are_served() {
        let router = build_handler(lazy_pool(), &EngineConfig::default(), None, LICENSE).unwrap();
        let request = Request::get("/graphql?query=%7B__typename%7D")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["__typename"].is_string());
    }

    #[tokio::test]
    async fn missing_operation_is_a_bad_request() {
        let router = build_handler(lazy_pool(), &EngineConfig::default(), None, LICENSE).unwrap();
        let (status, body) = send(router, Request::get(GRAPHQL_ROUTE).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["errors"].is_array());
    }

    #[tokio::test]
    async fn depth_ceiling_rejects_deep_queries() {
        let config = EngineConfig {
            depth_limit: Some(2),
            ..EngineConfig::default()
        };
        let router = build_handler(lazy_pool(), &config, Some(cached_catalog()), LICENSE).unwrap();
        let (status, body) = send(router, post("{ tables { columns { name } } }")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["errors"].is_array());
        assert!(body["data"].is_null());
    }

    #[tokio::test]
    async fn cached_catalog_answers_without_database() {
        let router = build_handler(lazy_pool(), &EngineConfig::default(), Some(cached_catalog()), LICENSE).unwrap();
        let (_, body) = send(router, post("{ tables { name columns { name dataType } } }")).await;
        assert_eq!(body["data"]["tables"][0]["name"], "cases");
        assert_eq!(body["data"]["tables"][0]["columns"][1]["dataType"], "text");
    }

    #[tokio::test]
    async fn unknown_tables_are_rejected() {
        let router = build_handler(lazy_pool(), &EngineConfig::default(), Some(cached_catalog()), LICENSE).unwrap();
        let (_, body) = send(router, post(r#"{ rows(table: "missing") }"#)).await;
        let message = body["errors"][0]["message"].as_str().unwrap();
        assert!(message.contains("unknown table"));
    }

    #[tokio::test]
    async fn default_mutations_are_refused_when_disabled() {
        let router = build_handler(lazy_pool(), &EngineConfig::default(), Some(cached_catalog()), LICENSE).unwrap();
        let (_, body) = send(
            router,
            post(r#"mutation { insertRow(table: "cases", values: {title: "x"}) }"#),
        )
        .await;
        assert!(body["errors"].is_array());
    }

    #[tokio::test]
    async fn enabled_mutations_validate_columns() {
        let config = EngineConfig {
            disable_default_mutations: false,
            ..EngineConfig::default()
        };
        let router = build_handler(lazy_pool(), &config, Some(cached_catalog()), LICENSE).unwrap();
        let (_, body) = send(
            router,
            post(r#"mutation { insertRow(table: "cases", values: {court: "x"}) }"#),
        )
        .await;
        let message = body["errors"][0]["message"].as_str().unwrap();
        assert!(message.contains("unknown column 'court'"));
    }

    #[tokio::test]
    async fn cors_preflight_is_answered() {
        let router = build_handler(lazy_pool(), &EngineConfig::default(), None, LICENSE).unwrap();
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri(GRAPHQL_ROUTE)
            .header(header::ORIGIN, "https://app.example.org")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn request_context_reaches_resolvers() {
        let router = build_handler(lazy_pool(), &EngineConfig::default(), None, LICENSE).unwrap();
        let mut request = post("{ requestId }");
        request
            .extensions_mut()
            .insert(InvocationContext(serde_json::json!({ "requestId": "req-7" })));
        let (_, body) = send(router.clone(), request).await;
        assert_eq!(body["data"]["requestId"], "req-7");

        let (_, body) = send(router, post("{ requestId }")).await;
        assert!(body["data"]["requestId"].is_null());
    }

    #[tokio::test]
    async fn blank_licence_refuses_to_build() {
        for license in ["", "  "] {
            let built = build_handler(lazy_pool(), &EngineConfig::default(), None, license);
            assert!(matches!(built, Err(Error::Configuration(_))));
        }
    }

    #[test]
    fn zero_ceilings_are_rejected() {
        let config = EngineConfig {
            cost_limit: Some(0),
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }
}
