//! HTTP authorization client
//!
//! Asks the things service whether a token may access a channel:
//!
//! - `POST {url}/channels/{channel_id}/access` with `{"token": "..."}`
//!   - `200 {"id": "<thing id>"}` → allowed
//!   - `401`, `403`, `404` → denied
//!   - anything else → authority error
//! - `GET {url}/health` → reachability probe used at startup

use async_trait::async_trait;
use reqwest::{Certificate, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use super::{AccessAuthority, AccessError, Identity};
use crate::config::AuthConfig;

/// Authorization authority reached over HTTP
pub struct HttpAuthority {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct AccessRequest<'a> {
    token: &'a str,
}

#[derive(Deserialize)]
struct AccessResponse {
    id: String,
}

/// Errors building the client; fatal at startup
#[derive(Error, Debug)]
pub enum AuthSetupError {
    #[error("Failed to load CA certificates from {path:?}: {error}")]
    CaCerts { path: PathBuf, error: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

impl HttpAuthority {
    /// Build the client, loading the CA bundle when TLS is enabled
    pub fn new(config: &AuthConfig) -> Result<Self, AuthSetupError> {
        let mut builder = Client::builder().timeout(Duration::from_millis(config.timeout_ms));

        if config.client_tls {
            if !config.ca_certs.is_empty() {
                let path = PathBuf::from(&config.ca_certs);
                let pem = std::fs::read(&path).map_err(|e| AuthSetupError::CaCerts {
                    path: path.clone(),
                    error: e.to_string(),
                })?;
                let cert = Certificate::from_pem(&pem).map_err(|e| AuthSetupError::CaCerts {
                    path,
                    error: e.to_string(),
                })?;
                builder = builder.add_root_certificate(cert);
            }
            builder = builder.https_only(true);
        } else {
            tracing::info!("Authorization communication is not encrypted");
        }

        Ok(Self {
            client: builder.build()?,
            base_url: base_url(&config.url, config.client_tls),
        })
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check that the authority is reachable
    pub async fn health_check(&self) -> Result<(), AccessError> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await.map_err(request_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AccessError::Unavailable(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }
}

#[async_trait]
impl AccessAuthority for HttpAuthority {
    async fn check_access(&self, token: &str, channel_id: &str) -> Result<Identity, AccessError> {
        if token.is_empty() {
            return Err(AccessError::Denied);
        }

        let url = format!("{}/channels/{}/access", self.base_url, channel_id);
        let response = self
            .client
            .post(&url)
            .json(&AccessRequest { token })
            .send()
            .await
            .map_err(request_error)?;

        match response.status() {
            StatusCode::OK => {
                let body: AccessResponse = response
                    .json()
                    .await
                    .map_err(|e| AccessError::Unavailable(format!("invalid response: {}", e)))?;
                Ok(Identity(body.id))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                Err(AccessError::Denied)
            }
            status => Err(AccessError::Unavailable(format!(
                "unexpected status {}",
                status
            ))),
        }
    }
}

fn request_error(e: reqwest::Error) -> AccessError {
    if e.is_timeout() {
        AccessError::Unavailable("request timed out".to_string())
    } else if e.is_connect() {
        AccessError::Unavailable("connection refused".to_string())
    } else {
        AccessError::Unavailable(e.to_string())
    }
}

/// `host:port` → `http(s)://host:port`
fn base_url(url: &str, tls: bool) -> String {
    let url = url.trim_end_matches('/');
    if url.contains("://") {
        url.to_string()
    } else if tls {
        format!("https://{}", url)
    } else {
        format!("http://{}", url)
    }
}
