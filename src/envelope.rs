//! API Gateway proxy envelopes and their translation to and from `http` types.
//!
//! The translation is structural: method, path, query, headers and body are
//! carried across unchanged, and the response status, headers and body are
//! copied back verbatim.

use std::collections::BTreeMap;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationEnvelope {
    pub http_method: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub multi_value_headers: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    pub query_string_parameters: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub multi_value_query_string_parameters: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub is_base64_encoded: bool,
    #[serde(default)]
    pub request_context: serde_json::Value,
}

/// The gateway's `requestContext`, attached to every translated request.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationContext(pub serde_json::Value);

impl InvocationEnvelope {
    pub fn into_request(self) -> Result<Request<Body>> {
        let method = Method::from_bytes(self.http_method.as_bytes())
            .map_err(|_| Error::Envelope(format!("unsupported method '{}'", self.http_method)))?;
        let uri = self.uri()?;
        let headers = self.header_map()?;
        let body = self.decode_body()?;

        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(target) = builder.headers_mut() {
            *target = headers;
        }
        builder
            .extension(InvocationContext(self.request_context))
            .body(Body::from(body))
            .map_err(|e| Error::Envelope(format!("cannot build request: {e}")))
    }

    fn uri(&self) -> Result<String> {
        let path = self.path.as_deref().filter(|p| !p.is_empty()).unwrap_or("/");
        if !path.starts_with('/') {
            return Err(Error::Envelope(format!("path '{path}' is not absolute")));
        }

        let mut query = url::form_urlencoded::Serializer::new(String::new());
        let mut has_query = false;
        match (&self.multi_value_query_string_parameters, &self.query_string_parameters) {
            (Some(multi), _) if !multi.is_empty() => {
                for (name, values) in multi {
                    for value in values {
                        query.append_pair(name, value);
                        has_query = true;
                    }
                }
            }
            (_, Some(single)) => {
                for (name, value) in single {
                    query.append_pair(name, value);
                    has_query = true;
                }
            }
            _ => {}
        }

        if has_query {
            Ok(format!("{path}?{}", query.finish()))
        } else {
            Ok(path.to_string())
        }
    }

    // Multi-value headers win; single-value headers fill in anything missing.
    fn header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        if let Some(multi) = &self.multi_value_headers {
            for (name, values) in multi {
                let name = header_name(name)?;
                for value in values {
                    map.append(name.clone(), header_value(&name, value)?);
                }
            }
        }
        if let Some(single) = &self.headers {
            for (name, value) in single {
                let name = header_name(name)?;
                if !map.contains_key(&name) {
                    let value = header_value(&name, value)?;
                    map.insert(name, value);
                }
            }
        }
        Ok(map)
    }

    fn decode_body(&self) -> Result<Vec<u8>> {
        match &self.body {
            None => Ok(Vec::new()),
            Some(body) if self.is_base64_encoded => STANDARD
                .decode(body)
                .map_err(|e| Error::Envelope(format!("body is not valid base64: {e}"))),
            Some(body) => Ok(body.clone().into_bytes()),
        }
    }
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| Error::Envelope(format!("invalid header name '{name}'")))
}

fn header_value(name: &HeaderName, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| Error::Envelope(format!("invalid value for header '{name}'")))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub multi_value_headers: BTreeMap<String, Vec<String>>,
    pub body: String,
    pub is_base64_encoded: bool,
}

impl ResponseEnvelope {
    pub async fn from_response(response: Response<Body>) -> Result<Self> {
        let (parts, body) = response.into_parts();
        let bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| Error::Engine(format!("cannot read response body: {e}")))?;

        let mut headers = BTreeMap::new();
        let mut multi_value_headers = BTreeMap::new();
        for name in parts.headers.keys() {
            let mut values: Vec<String> = parts
                .headers
                .get_all(name)
                .iter()
                .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
                .collect();
            if values.len() == 1 {
                headers.insert(name.to_string(), values.remove(0));
            } else {
                multi_value_headers.insert(name.to_string(), values);
            }
        }

        let (body, is_base64_encoded) = match String::from_utf8(bytes.to_vec()) {
            Ok(text) => (text, false),
            Err(raw) => (STANDARD.encode(raw.into_bytes()), true),
        };

        Ok(Self {
            status_code: parts.status.as_u16(),
            headers,
            multi_value_headers,
            body,
            is_base64_encoded,
        })
    }

    /// A JSON error body in the same shape the engine uses.
    pub fn from_error(status: StatusCode, err: &Error) -> Self {
        let body = serde_json::json!({ "errors": [{ "message": err.to_string() }] });
        Self {
            status_code: status.as_u16(),
            headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
            multi_value_headers: BTreeMap::new(),
            body: body.to_string(),
            is_base64_encoded: false,
        }
    }
}
