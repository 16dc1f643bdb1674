//! Authorization Client
//!
//! Every publish and subscribe asks an external authority whether a token
//! grants access to a channel. Verdicts are never cached: tokens may be
//! short-lived or revoked between two requests of the same connection.
//!
//! - [`HttpAuthority`]: network-addressed authority, optional TLS with a CA bundle
//! - [`StaticAuthority`]: in-process token table for tests and local runs

mod http;
mod memory;

pub use http::{AuthSetupError, HttpAuthority};
pub use memory::StaticAuthority;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::error::AdapterError;

/// Identity of the thing owning a granted token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Failure of an access check
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// The authority refused the token for this channel
    #[error("access denied")]
    Denied,

    /// The authority could not be asked
    #[error("authorization service unavailable: {0}")]
    Unavailable(String),
}

/// Verdict-returning channel-ownership authority
#[async_trait]
pub trait AccessAuthority: Send + Sync {
    /// Check that `token` may access `channel_id`, returning the token's identity
    async fn check_access(&self, token: &str, channel_id: &str) -> Result<Identity, AccessError>;
}

impl From<AccessError> for AdapterError {
    // Authority failures fail closed
    fn from(err: AccessError) -> Self {
        AdapterError::Unauthorized(err.to_string())
    }
}
