//! Precomputed schema cache.
//!
//! Some deployments ship the catalog as a JSON document so a cold start does
//! not have to introspect the database before serving the first query.

use std::path::PathBuf;
use std::time::Duration;

use tracing::info;
use url::Url;

use super::catalog::Catalog;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaCacheSource {
    File(PathBuf),
    Http(Url),
}

impl SchemaCacheSource {
    /// Accepts `file://` and `http(s)://` URIs or a bare filesystem path.
    pub fn parse(raw: &str) -> Result<Self> {
        match Url::parse(raw) {
            Ok(url) => match url.scheme() {
                "file" => url.to_file_path().map(SchemaCacheSource::File).map_err(|_| {
                    Error::configuration(format!("schema cache path '{raw}' is not a local path"))
                }),
                "http" | "https" => Ok(SchemaCacheSource::Http(url)),
                other => Err(Error::configuration(format!(
                    "unsupported schema cache scheme '{other}'"
                ))),
            },
            Err(url::ParseError::RelativeUrlWithoutBase) => Ok(SchemaCacheSource::File(PathBuf::from(raw))),
            Err(e) => Err(Error::configuration(format!(
                "schema cache source '{raw}' is invalid: {e}"
            ))),
        }
    }

    async fn fetch(&self, timeout: Duration) -> Result<Vec<u8>> {
        match self {
            SchemaCacheSource::File(path) => tokio::fs::read(path).await.map_err(|e| {
                Error::Engine(format!("cannot read schema cache {}: {e}", path.display()))
            }),
            SchemaCacheSource::Http(url) => {
                let client = reqwest::Client::builder()
                    .timeout(timeout)
                    .build()
                    .map_err(|e| Error::Engine(format!("cannot build schema cache client: {e}")))?;
                let response = client
                    .get(url.clone())
                    .send()
                    .await
                    .and_then(|response| response.error_for_status())
                    .map_err(|e| Error::Engine(format!("cannot fetch schema cache: {e}")))?;
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| Error::Engine(format!("cannot read schema cache body: {e}")))?;
                Ok(bytes.to_vec())
            }
        }
    }
}

/// Fetch and decode the cache, checking it describes the exposed schema.
/// HTTP fetches that take longer than `timeout` fail setup.
pub async fn load_schema_cache(
    source: Option<&SchemaCacheSource>,
    schema: &str,
    timeout: Duration,
) -> Result<Option<Catalog>> {
    let Some(source) = source else {
        return Ok(None);
    };
    let bytes = source.fetch(timeout).await?;
    let catalog: Catalog = serde_json::from_slice(&bytes)
        .map_err(|e| Error::configuration(format!("schema cache is not a valid catalog: {e}")))?;
    if catalog.schema != schema {
        return Err(Error::configuration(format!(
            "schema cache describes '{}' but the engine exposes '{schema}'",
            catalog.schema
        )));
    }
    info!(tables = catalog.tables.len(), "loaded precomputed schema cache");
    Ok(Some(catalog))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn parses_supported_sources() {
        assert_eq!(
            SchemaCacheSource::parse("/opt/cache/catalog.json").unwrap(),
            SchemaCacheSource::File(PathBuf::from("/opt/cache/catalog.json"))
        );
        assert_eq!(
            SchemaCacheSource::parse("file:///opt/cache/catalog.json").unwrap(),
            SchemaCacheSource::File(PathBuf::from("/opt/cache/catalog.json"))
        );
        assert!(matches!(
            SchemaCacheSource::parse("https://cdn.example.org/catalog.json").unwrap(),
            SchemaCacheSource::Http(_)
        ));
        assert!(matches!(
            SchemaCacheSource::parse("s3://bucket/catalog.json"),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn loads_catalog_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let catalog = Catalog::from_columns("main", vec![("cases".into(), "id".into(), "integer".into())]);
        std::fs::write(file.path(), serde_json::to_vec(&catalog).unwrap()).unwrap();

        let source = SchemaCacheSource::File(file.path().to_path_buf());
        let loaded = load_schema_cache(Some(&source), "main", TIMEOUT).await.unwrap();
        assert_eq!(loaded, Some(catalog));

        let mismatch = load_schema_cache(Some(&source), "public", TIMEOUT).await;
        assert!(matches!(mismatch, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn missing_file_is_an_engine_error() {
        let source = SchemaCacheSource::File(PathBuf::from("/nonexistent/catalog.json"));
        assert!(matches!(
            load_schema_cache(Some(&source), "main", TIMEOUT).await,
            Err(Error::Engine(_))
        ));
        assert_eq!(load_schema_cache(None, "main", TIMEOUT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stalled_http_source_times_out() {
        // Accepts the connection and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let _held = socket;
            std::future::pending::<()>().await;
        });

        let source = SchemaCacheSource::parse(&format!("http://{addr}/catalog.json")).unwrap();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            load_schema_cache(Some(&source), "main", Duration::from_millis(200)),
        )
        .await
        .expect("fetch should give up on its own");
        assert!(matches!(outcome, Err(Error::Engine(_))));
    }
}
