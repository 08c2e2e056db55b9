//! Thin relay to the external scanner service.
//!
//! The scanner exposes `POST /trigger` and `GET /status`, both answering JSON.
//! Bodies are relayed untouched. There are no retries: one attempt per call,
//! bounded by the configured timeout.

use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Connection refused, DNS failure, timeout.
    #[error("scanner unavailable: {0}")]
    Unavailable(String),

    #[error("scanner returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("scanner configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone)]
pub struct ScannerClient {
    client: Client,
    base: Url,
}

impl ScannerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProxyError> {
        let mut base = Url::parse(base_url).map_err(|e| ProxyError::Config(format!("{base_url}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ProxyError::Config(format!("{base_url}: scheme must be http or https")));
        }
        // Url::join drops the last segment unless the path ends with a slash
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| ProxyError::Config(e.to_string()))?;
        Ok(ScannerClient { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Starts a scan on the scanner service.
    pub async fn trigger(&self) -> Result<Value, ProxyError> {
        self.call(Method::POST, "trigger").await
    }

    pub async fn status(&self) -> Result<Value, ProxyError> {
        self.call(Method::GET, "status").await
    }

    async fn call(&self, method: Method, path: &str) -> Result<Value, ProxyError> {
        let url = self.base.join(path).map_err(|e| ProxyError::Config(e.to_string()))?;
        debug!(%url, %method, "scanner request");
        let resp = self.client.request(method, url.clone()).send().await.map_err(|e| {
            warn!(%url, error = %e, "scanner unreachable");
            ProxyError::Unavailable(e.to_string())
        })?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| ProxyError::Unavailable(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| {
            warn!(%url, %status, "scanner body is not JSON");
            ProxyError::InvalidResponse(format!("HTTP {status}: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    async fn mock_scanner(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn rejects_bad_base_url() {
        assert!(matches!(ScannerClient::new("not a url", DEFAULT_TIMEOUT), Err(ProxyError::Config(_))));
        assert!(matches!(ScannerClient::new("ftp://scanner", DEFAULT_TIMEOUT), Err(ProxyError::Config(_))));
    }

    #[test]
    fn base_path_is_kept() {
        let c = ScannerClient::new("http://scanner:8001/api", DEFAULT_TIMEOUT).unwrap();
        assert_eq!(c.base_url().join("status").unwrap().as_str(), "http://scanner:8001/api/status");
    }

    #[tokio::test]
    async fn relays_json_bodies() {
        let router = Router::new()
            .route("/trigger", post(|| async { Json(json!({"status": "started", "job": 7})) }))
            .route("/status", get(|| async { Json(json!({"running": false, "last_scan": null})) }));
        let base = mock_scanner(router).await;
        let c = ScannerClient::new(&base, DEFAULT_TIMEOUT).unwrap();
        assert_eq!(c.trigger().await.unwrap(), json!({"status": "started", "job": 7}));
        assert_eq!(c.status().await.unwrap()["running"], json!(false));
    }

    #[tokio::test]
    async fn non_json_body_is_invalid_response() {
        let router = Router::new().route("/status", get(|| async { "<html>oops</html>" }));
        let base = mock_scanner(router).await;
        let c = ScannerClient::new(&base, DEFAULT_TIMEOUT).unwrap();
        assert!(matches!(c.status().await, Err(ProxyError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn unreachable_scanner_is_unavailable() {
        // Bind then drop to get a port with nothing listening
        let addr = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let c = ScannerClient::new(&format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        assert!(matches!(c.trigger().await, Err(ProxyError::Unavailable(_))));
    }

    #[tokio::test]
    async fn slow_scanner_times_out() {
        let router = Router::new().route(
            "/status",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({}))
            }),
        );
        let base = mock_scanner(router).await;
        let c = ScannerClient::new(&base, Duration::from_millis(200)).unwrap();
        assert!(matches!(c.status().await, Err(ProxyError::Unavailable(_))));
    }
}
