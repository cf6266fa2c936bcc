//! C1: shared HTTP client.
//!
//! One `reqwest::Client` per process, built once from [`HttpConfig`] and handed
//! out as an `Arc`. Every GET goes through here so headers, timeouts, and the
//! redirect cap are applied uniformly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::redirect::Policy;

use crate::config::HttpConfig;
use crate::error::{EngineError, Result};

#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    read_timeout: Duration,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Result<Arc<Self>> {
        Self::with_pool_size(config, config.max_redirects.max(8))
    }

    /// Build the shared client with its idle-connection pool sized to
    /// `pool_size` (§4.5's "Concurrency knob": the pool must not be smaller
    /// than the largest per-task thread budget in flight).
    pub fn with_pool_size(config: &HttpConfig, pool_size: usize) -> Result<Arc<Self>> {
        let inner = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(Policy::limited(config.max_redirects))
            .pool_max_idle_per_host(pool_size)
            .build()
            .map_err(EngineError::Network)?;
        Ok(Arc::new(Self {
            inner,
            read_timeout: config.read_timeout,
        }))
    }

    /// Fetch `url` as UTF-8 text (used for the manifest itself).
    pub async fn get_text(&self, url: &str, headers: &HashMap<String, String>) -> Result<String> {
        let bytes = self.get_bytes(url, headers).await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| EngineError::Other(format!("response from {url} was not UTF-8: {e}")))
    }

    /// Fetch `url` as raw bytes (segments, keys).
    pub async fn get_bytes(&self, url: &str, headers: &HashMap<String, String>) -> Result<Bytes> {
        let mut request = self.inner.get(url).timeout(self.read_timeout);
        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(EngineError::Network)?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::http(status, url.to_string()));
        }
        response.bytes().await.map_err(EngineError::Network)
    }
}
