// # Shared HTTP plumbing
//
// Both the Octavia and the Neutron client speak the same OpenStack dialect:
// a Keystone token in `X-Auth-Token`, JSON bodies wrapped in a single
// resource key (`{"pool": {...}}`), and `*_links` arrays for marker
// pagination. Status codes are classified here once so every call reports
// failures the way the engine expects.

use lbsync_core::{Error, Result};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;

/// Default HTTP timeout for API requests (30 seconds)
pub(crate) const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Keystone token header
const AUTH_HEADER: &str = "X-Auth-Token";

/// Longest slice of an error body kept in error messages
const MAX_ERROR_BODY: usize = 200;

/// Authenticated JSON client for one OpenStack endpoint
///
/// # Security
///
/// The token is sent as a header only; it never appears in logs, errors or
/// Debug output.
#[derive(Clone)]
pub(crate) struct ApiClient {
    /// Service name used in logs and error messages ("octavia", "neutron")
    service: &'static str,

    /// Endpoint without trailing slash
    base_url: String,

    /// Keystone token
    /// ⚠️ NEVER log this value
    auth_token: String,

    http: reqwest::Client,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("service", &self.service)
            .field("base_url", &self.base_url)
            .field("auth_token", &"<REDACTED>")
            .finish()
    }
}

impl ApiClient {
    /// Build a client for `base_url`
    ///
    /// Fails fast on an empty endpoint or token.
    pub(crate) fn new(
        service: &'static str,
        base_url: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let auth_token = auth_token.into();

        if base_url.is_empty() {
            return Err(Error::config(format!("{} endpoint cannot be empty", service)));
        }
        if auth_token.is_empty() {
            return Err(Error::config(format!("{} auth token cannot be empty", service)));
        }

        let http = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            service,
            base_url,
            auth_token,
            http,
        })
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET `path` and decode the JSON body
    pub(crate) async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let request = self.http.get(self.url(path)).query(query);
        let response = self.send(request, "GET", path).await?;
        self.decode(response, path).await
    }

    /// POST a JSON body to `path` and decode the JSON response
    pub(crate) async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.http.post(self.url(path)).json(body);
        let response = self.send(request, "POST", path).await?;
        self.decode(response, path).await
    }

    /// DELETE `path`; the response body is ignored
    pub(crate) async fn delete(&self, path: &str) -> Result<()> {
        let request = self.http.delete(self.url(path));
        self.send(request, "DELETE", path).await?;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder, method: &str, path: &str) -> Result<Response> {
        tracing::debug!(service = self.service, "{} {}", method, path);

        let response = request
            .header(AUTH_HEADER, &self.auth_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| transport_error(self.service, &e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error response".to_string());

        tracing::debug!(service = self.service, %status, "{} {} failed", method, path);
        Err(status_error(self.service, status, &format!("{} {}", method, path), &body))
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response, path: &str) -> Result<T> {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(self.service, &e))?;

        serde_json::from_slice(&bytes).map_err(|e| {
            Error::Other(format!(
                "{}: unexpected response from {}: {}",
                self.service, path, e
            ))
        })
    }
}

/// Classify a non-success HTTP status
///
/// | Status            | Error              |
/// |-------------------|--------------------|
/// | 401               | `Config`           |
/// | 400, 403          | `Validation`       |
/// | 404               | `NotFound`         |
/// | 409               | `ResourceConflict` |
/// | 429, 5xx          | `TransientApi`     |
pub(crate) fn status_error(service: &str, status: StatusCode, what: &str, body: &str) -> Error {
    let detail = format!("{}: {} returned {}: {}", service, what, status, summarize(body));

    match status.as_u16() {
        401 => Error::config(format!(
            "{}: authentication failed, token rejected ({})",
            service, status
        )),
        400 | 403 => Error::validation(detail),
        404 => Error::not_found(detail),
        409 => Error::conflict(detail),
        429 | 500..=599 => Error::transient(detail),
        _ => Error::Other(detail),
    }
}

/// Classify a failure that produced no HTTP status
fn transport_error(service: &str, err: &reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Error::transient(format!("{}: request failed: {}", service, err))
    } else {
        Error::Other(format!("{}: {}", service, err))
    }
}

fn summarize(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY {
        return trimmed.to_string();
    }
    let mut short: String = trimmed.chars().take(MAX_ERROR_BODY).collect();
    short.push('…');
    short
}

/// Wrap a request body in its resource key
pub(crate) fn envelope<T: Serialize + ?Sized>(key: &str, body: &T) -> Result<serde_json::Value> {
    let mut map = serde_json::Map::new();
    map.insert(key.to_string(), serde_json::to_value(body)?);
    Ok(serde_json::Value::Object(map))
}

/// Take the resource out of a single-key response body
pub(crate) fn unwrap_key<T>(mut body: HashMap<String, T>, key: &str) -> Result<T> {
    body.remove(key)
        .ok_or_else(|| Error::Other(format!("response is missing '{}'", key)))
}

/// Pagination link of a collection response
#[derive(Debug, Clone, serde::Deserialize)]
pub(crate) struct Link {
    pub href: String,
    pub rel: String,
}

/// Marker of the next page, taken from the `rel="next"` link
pub(crate) fn next_marker(links: &[Link]) -> Option<String> {
    let next = links.iter().find(|link| link.rel == "next")?;
    let url = reqwest::Url::parse(&next.href).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "marker")
        .map(|(_, value)| value.into_owned())
}
