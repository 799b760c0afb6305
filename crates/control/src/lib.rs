//! Rudder control-plane client.
//!
//! [`Poller`] fetches the desired state, [`Reporter`] pushes status snapshots back.
//! [`HttpControlPlane`] implements both over HTTP with basic auth (empty user,
//! token as password). Neither retries; the reconciliation loop owns retry.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use reqwest::StatusCode;
use rudder_core::{AppStatus, DesiredState, RudderError, RudderResult};
use tracing::debug;
use url::Url;

pub const DESIRED_STATE_PATH: &str = "/api/v1/deploy/desired";
pub const CURRENT_STATE_PATH: &str = "/api/v1/current";

#[async_trait::async_trait]
pub trait Poller: Send + Sync {
    /// One request for the desired state; no retries.
    async fn poll(&self) -> RudderResult<DesiredState>;
}

#[async_trait::async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, status: &AppStatus) -> RudderResult<()>;
}

#[derive(Clone)]
pub struct HttpControlPlane {
    desired_url: Url,
    current_url: Url,
    token: String,
    http: reqwest::Client,
}

impl fmt::Debug for HttpControlPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpControlPlane")
            .field("desired_url", &self.desired_url.as_str())
            .field("current_url", &self.current_url.as_str())
            .field("token", &"<redacted>")
            .finish()
    }
}

fn endpoint_url(endpoint: &Url, path: &str) -> Result<Url> {
    // Appended rather than joined so an endpoint base path survives.
    let raw = format!("{}{}", endpoint.as_str().trim_end_matches('/'), path);
    Url::parse(&raw).with_context(|| format!("building control-plane url {}", raw))
}

impl HttpControlPlane {
    /// `timeout` bounds every request end to end.
    pub fn new(endpoint: &Url, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(Self {
            desired_url: endpoint_url(endpoint, DESIRED_STATE_PATH)?,
            current_url: endpoint_url(endpoint, CURRENT_STATE_PATH)?,
            token: token.into(),
            http,
        })
    }
}

#[async_trait::async_trait]
impl Poller for HttpControlPlane {
    async fn poll(&self) -> RudderResult<DesiredState> {
        let t0 = Instant::now();
        debug!(uri = %self.desired_url, "requesting desired state");
        let resp = self
            .http
            .get(self.desired_url.clone())
            .basic_auth("", Some(&self.token))
            .send()
            .await
            .map_err(|e| RudderError::Network(e.to_string()))?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(RudderError::Status { code: status.as_u16() });
        }
        let body = resp.bytes().await.map_err(|e| RudderError::Network(e.to_string()))?;
        let desired: DesiredState =
            serde_json::from_slice(&body).map_err(|e| RudderError::Decode(format!("desired state document: {}", e)))?;
        histogram!("poll_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(present = desired.present.len(), missing = desired.missing.len(), "desired state received");
        Ok(desired)
    }
}

#[async_trait::async_trait]
impl Reporter for HttpControlPlane {
    async fn report(&self, status: &AppStatus) -> RudderResult<()> {
        debug!(uri = %self.current_url, resources = status.resource_states.len(), "reporting app status");
        let resp = self
            .http
            .post(self.current_url.clone())
            .basic_auth("", Some(&self.token))
            .json(status)
            .send()
            .await
            .map_err(|e| RudderError::Report(e.to_string()))?;
        let code = resp.status();
        if code != StatusCode::OK {
            counter!("report_err", 1u64);
            return Err(RudderError::Report(format!("unexpected status code from control plane: {}", code.as_u16())));
        }
        counter!("report_ok", 1u64);
        Ok(())
    }
}
