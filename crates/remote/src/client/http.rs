//! Shared HTTP plumbing for the cache service clients

use crate::error::{RemoteError, Result};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use tracing::warn;

/// Build a client with a user agent and no default auth.
///
/// Auth is attached per request so blob URLs (which are pre-signed)
/// never receive the service token.
pub fn build_client(user_agent: &str) -> Result<Client> {
    Client::builder()
        .user_agent(user_agent)
        .build()
        .map_err(|e| RemoteError::Config(format!("failed to create HTTP client: {e}")))
}

/// Headers attached to every request of one service
#[derive(Debug, Clone)]
pub struct ServiceHeaders {
    headers: HeaderMap,
}

impl ServiceHeaders {
    /// Bearer auth plus an `Accept` header and any extra headers.
    ///
    /// Values with characters that cannot appear in a header are skipped
    /// with an error log; the service will then reject the request.
    pub fn new(token: &str, accept: &str, extra: &BTreeMap<String, String>) -> Self {
        let mut headers = HeaderMap::new();

        if let Ok(value) = HeaderValue::from_str(accept) {
            headers.insert(ACCEPT, value);
        }

        if !token.is_empty() {
            match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    headers.insert(AUTHORIZATION, value);
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        "Bearer token contains invalid characters, proceeding without auth"
                    );
                }
            }
        }

        for (name, value) in extra {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Skipping invalid request header"),
            }
        }

        Self { headers }
    }

    /// Apply the headers to a request
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        request.headers(self.headers.clone())
    }
}

/// Send a request, mapping transport failures
pub async fn send(operation: &str, request: RequestBuilder) -> Result<Response> {
    request
        .send()
        .await
        .map_err(|e| RemoteError::http(operation, e))
}

/// Turn a non-2xx response into [`RemoteError::Status`]
pub async fn ensure_success(operation: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::status(operation, status.as_u16(), body))
}

/// Decode a JSON response body
pub async fn read_json<T: DeserializeOwned>(operation: &str, response: Response) -> Result<T> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| RemoteError::http(operation, e))?;
    serde_json::from_slice(&bytes).map_err(|e| RemoteError::serialization(operation, e.to_string()))
}

/// Whole milliseconds, saturating
pub(crate) fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
