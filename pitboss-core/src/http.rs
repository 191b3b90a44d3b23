//! Minimal HTTP client for the grill's LAN endpoints
//!
//! The grill's embedded web server is only happy with short-lived
//! connections, so the client disables connection pooling, sends
//! `Connection: close` on every request, and applies one timeout to
//! connect and I/O combined. Failures map onto the transport taxonomy
//! instead of panicking.

use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::REQUEST_TIMEOUT;
use crate::{Error, Result};

/// Response to a single grill request.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON, mapping failure onto `ProtocolDecode`.
    pub fn json(&self) -> Result<Value> {
        serde_json::from_str(&self.body)
            .map_err(|e| Error::ProtocolDecode(format!("bad response body: {}", e)))
    }
}

/// Connection-per-request HTTP client.
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| Error::Connect(e.to_string()))?;
        Ok(Self { inner })
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        debug!(url, "GET");
        let resp = self
            .inner
            .get(url)
            .header("Connection", "close")
            .send()
            .await?;
        Self::read(resp).await
    }

    pub async fn post_json(&self, url: &str, body: &Value) -> Result<Response> {
        debug!(url, "POST");
        let resp = self
            .inner
            .post(url)
            .header("Connection", "close")
            .json(body)
            .send()
            .await?;
        Self::read(resp).await
    }

    async fn read(resp: reqwest::Response) -> Result<Response> {
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(Response { status, body })
    }
}
