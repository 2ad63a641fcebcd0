//! Control-plane client
//!
//! Calls `POST /register`. Client errors (4xx) are terminal; server errors
//! and transport failures are retried with linear backoff. Retrying is safe
//! because registration is idempotent per identity.

use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::api::{ErrorResponse, PeerEntry, RegisterRequest, RegisterResponse};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::identity::Identity;

/// What the control plane handed back
#[derive(Debug, Clone)]
pub struct Registration {
    /// Own address with the mesh prefix
    pub address: Ipv4Net,
    pub peers: Vec<PeerEntry>,
}

impl Registration {
    /// The whole mesh range
    pub fn mesh(&self) -> Ipv4Net {
        self.address.trunc()
    }
}

/// Anything that can register an identity
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, identity: &Identity) -> Result<Registration>;
}

/// HTTP client for the control-plane API
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    attempts: u32,
    backoff: Duration,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str, timeout: Duration, attempts: u32, backoff: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            attempts: attempts.max(1),
            backoff,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::new(
            &config.client.control_url,
            config.request_timeout(),
            config.client.register_attempts,
            config.retry_backoff(),
        )
    }

    /// One registration request, no retry
    pub async fn register_once(&self, identity: &Identity) -> Result<Registration> {
        let url = format!("{}/register", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&RegisterRequest {
                public_key: identity.to_base64(),
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| format!("{} ({})", e.error, e.code))
                .unwrap_or(body);
            return Err(if status.is_client_error() {
                Error::RegistrationRejected {
                    status: status.as_u16(),
                    message,
                }
            } else {
                Error::ServerUnavailable {
                    status: status.as_u16(),
                    message,
                }
            });
        }

        let body: RegisterResponse = resp.json().await?;
        let address: Ipv4Net = body
            .ip
            .parse()
            .map_err(|e| Error::Network(format!("bad address '{}' from control plane: {}", body.ip, e)))?;

        Ok(Registration {
            address,
            peers: body.peers,
        })
    }
}

#[async_trait]
impl Registrar for ControlPlaneClient {
    async fn register(&self, identity: &Identity) -> Result<Registration> {
        let mut attempt = 1;
        loop {
            match self.register_once(identity).await {
                Ok(reg) => return Ok(reg),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    let delay = self.backoff * attempt;
                    tracing::warn!(
                        "Registration attempt {}/{} failed: {} (retrying in {:?})",
                        attempt,
                        self.attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
