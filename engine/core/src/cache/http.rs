//! HTTP key-value L2 backend
//!
//! Talks to a small KV service:
//!
//! | Operation        | Request                               | Response                          |
//! |------------------|---------------------------------------|-----------------------------------|
//! | get              | `GET /v1/kv/{key}`                    | body, `x-ttl-remaining-ms`; 404   |
//! | set              | `PUT /v1/kv/{key}?ttl_ms=N`           | 2xx                               |
//! | delete pattern   | `DELETE /v1/kv?pattern=P`             | `{"deleted": n}`                  |
//! | health           | `GET /health`                         | 2xx                               |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;

use super::backend::{CacheBackend, CacheBackendError, L2Entry};

const TTL_HEADER: &str = "x-ttl-remaining-ms";

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    deleted: u64,
}

/// Remote L2 over HTTP
#[derive(Debug, Clone)]
pub struct HttpKvBackend {
    base: Url,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpKvBackend {
    /// Create a backend for `base_url`; per-request timeout applies to every call
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CacheBackendError> {
        let base = Url::parse(base_url).map_err(|e| CacheBackendError::Unavailable {
            backend: "http".into(),
            reason: format!("invalid url {base_url}: {e}"),
        })?;
        if base.cannot_be_a_base() {
            return Err(CacheBackendError::Unavailable {
                backend: "http".into(),
                reason: format!("{base_url} cannot be a base url"),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CacheBackendError::Unavailable {
                backend: "http".into(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            base,
            client,
            timeout,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn map_send_error(&self, e: reqwest::Error) -> CacheBackendError {
        if e.is_timeout() {
            CacheBackendError::Timeout {
                backend: self.name().to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            CacheBackendError::Unavailable {
                backend: self.name().to_string(),
                reason: e.to_string(),
            }
        }
    }

    fn status_error(&self, status: StatusCode) -> CacheBackendError {
        CacheBackendError::Unavailable {
            backend: self.name().to_string(),
            reason: format!("status {status}"),
        }
    }
}

#[async_trait]
impl CacheBackend for HttpKvBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn get(&self, key: &str) -> Result<Option<L2Entry>, CacheBackendError> {
        let response = self
            .client
            .get(self.url(&["v1", "kv", key]))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            s if !s.is_success() => return Err(self.status_error(s)),
            _ => {}
        }

        let ttl_remaining = response
            .headers()
            .get(TTL_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis);
        let body = response.bytes().await.map_err(|e| self.map_send_error(e))?;

        Ok(Some(L2Entry {
            value: body.to_vec(),
            ttl_remaining,
        }))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheBackendError> {
        let response = self
            .client
            .put(self.url(&["v1", "kv", key]))
            .query(&[("ttl_ms", ttl.as_millis().to_string())])
            .body(value.to_vec())
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.status_error(response.status()))
        }
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheBackendError> {
        let response = self
            .client
            .delete(self.url(&["v1", "kv"]))
            .query(&[("pattern", pattern)])
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(self.status_error(response.status()));
        }
        let body: DeleteResponse = response
            .json()
            .await
            .map_err(|e| CacheBackendError::Protocol {
                backend: self.name().to_string(),
                reason: e.to_string(),
            })?;
        Ok(body.deleted)
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(self.url(&["health"]))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building_escapes_keys() {
        let backend = HttpKvBackend::new("http://cache.local:8080/base/", Duration::from_millis(50)).unwrap();
        let url = backend.url(&["v1", "kv", "risk:acme:ab/cd"]);
        assert_eq!(url.as_str(), "http://cache.local:8080/base/v1/kv/risk:acme:ab%2Fcd");
    }

    #[test]
    fn test_rejects_invalid_url() {
        assert!(HttpKvBackend::new("not a url", Duration::from_millis(50)).is_err());
        assert!(HttpKvBackend::new("mailto:someone@example.com", Duration::from_millis(50)).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unhealthy() {
        // Port 9 (discard) on loopback is not expected to serve HTTP
        let backend = HttpKvBackend::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        assert!(!backend.health_check().await);
        assert!(backend.get("risk:acme:1").await.is_err());
    }
}
