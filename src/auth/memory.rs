//! In-process token table

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use super::{AccessAuthority, AccessError, Identity};

/// Authority backed by a token table held in memory
///
/// Tokens can be granted and revoked at runtime, which makes revocation
/// between two operations of one connection easy to exercise.
#[derive(Default)]
pub struct StaticAuthority {
    grants: RwLock<HashMap<String, Grant>>,
}

struct Grant {
    identity: Identity,
    /// `None` grants every channel
    channels: Option<HashSet<String>>,
}

impl StaticAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `token` access to the listed channel ids
    pub fn grant<I, S>(&self, token: &str, identity: &str, channels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grants.write().insert(
            token.to_string(),
            Grant {
                identity: Identity(identity.to_string()),
                channels: Some(channels.into_iter().map(Into::into).collect()),
            },
        );
    }

    /// Grant `token` access to every channel
    pub fn grant_all(&self, token: &str, identity: &str) {
        self.grants.write().insert(
            token.to_string(),
            Grant {
                identity: Identity(identity.to_string()),
                channels: None,
            },
        );
    }

    /// Revoke a token; later checks are denied
    pub fn revoke(&self, token: &str) -> bool {
        self.grants.write().remove(token).is_some()
    }
}

#[async_trait]
impl AccessAuthority for StaticAuthority {
    async fn check_access(&self, token: &str, channel_id: &str) -> Result<Identity, AccessError> {
        let grants = self.grants.read();
        let grant = grants.get(token).ok_or(AccessError::Denied)?;

        match &grant.channels {
            Some(channels) if !channels.contains(channel_id) => Err(AccessError::Denied),
            _ => Ok(grant.identity.clone()),
        }
    }
}
