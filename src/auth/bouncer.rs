//! Bouncers
//!
//! The manager never decides on keycards itself; it hands them to a
//! [`Bouncer`]. That is either an in-process implementation registered by
//! the embedder or a bouncer component in the atmosphere, reached over RPC
//! through [`RemoteBouncer`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::keycard::{Keycard, KeycardCredentials, KeycardState};
use crate::error::Result;
use crate::rpc::message::ComponentCall;
use crate::rpc::RemoteRef;

#[async_trait]
pub trait Bouncer: Send + Sync {
    /// Check a keycard; `None` means refused
    ///
    /// An accepted keycard comes back with an id and may carry a domain
    /// and a duration.
    async fn authenticate(&self, keycard: Keycard) -> Result<Option<Keycard>>;

    /// Refresh every keycard issued by `issuer_name`
    async fn keep_alive(&self, issuer_name: &str, ttl: f64) -> Result<()>;

    async fn remove_keycard(&self, keycard: &Keycard) -> Result<()> {
        match &keycard.id {
            Some(id) => self.remove_keycard_id(id).await,
            None => Ok(()),
        }
    }

    async fn remove_keycard_id(&self, keycard_id: &str) -> Result<()>;

    /// Revoke a keycard
    ///
    /// Returns the keycard when the caller must tell its requester; a
    /// bouncer that notifies requesters itself returns `None`.
    async fn expire_keycard(&self, keycard_id: &str) -> Result<Option<Keycard>>;

    /// Keycard classes this bouncer understands
    async fn keycard_classes(&self) -> Result<Vec<String>>;
}

/// Bouncer component reached over its component avatar
#[derive(Debug, Clone)]
pub struct RemoteBouncer {
    component_id: String,
    remote: RemoteRef,
}

impl RemoteBouncer {
    pub fn new(component_id: impl Into<String>, remote: RemoteRef) -> Self {
        Self {
            component_id: component_id.into(),
            remote,
        }
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }
}

#[async_trait]
impl Bouncer for RemoteBouncer {
    async fn authenticate(&self, keycard: Keycard) -> Result<Option<Keycard>> {
        self.remote
            .call_remote(&ComponentCall::Authenticate { keycard })
            .await
    }

    async fn keep_alive(&self, issuer_name: &str, ttl: f64) -> Result<()> {
        self.remote
            .call_remote(&ComponentCall::KeepAlive {
                issuer_name: issuer_name.to_string(),
                ttl,
            })
            .await
    }

    async fn remove_keycard_id(&self, keycard_id: &str) -> Result<()> {
        self.remote
            .call_remote(&ComponentCall::RemoveKeycardId {
                keycard_id: keycard_id.to_string(),
            })
            .await
    }

    async fn expire_keycard(&self, keycard_id: &str) -> Result<Option<Keycard>> {
        self.remote
            .call_remote::<_, ()>(&ComponentCall::ExpireKeycard {
                keycard_id: keycard_id.to_string(),
            })
            .await?;
        Ok(None)
    }

    async fn keycard_classes(&self) -> Result<Vec<String>> {
        self.remote
            .call_remote(&ComponentCall::GetKeycardClasses)
            .await
    }
}

/// In-process bouncer backed by fixed user and token tables
#[derive(Debug, Default)]
pub struct StaticBouncer {
    users: BTreeMap<String, String>,
    tokens: BTreeMap<String, String>,
    domain: Option<String>,
    duration: Option<f64>,
    next_id: AtomicU64,
    keycards: Mutex<HashMap<String, Keycard>>,
}

impl StaticBouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `username` with `password`
    pub fn user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }

    /// Accept `token`, recording `owner` in logs
    pub fn token(mut self, token: impl Into<String>, owner: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), owner.into());
        self
    }

    /// Domain stamped on accepted keycards
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Connection duration, in seconds, granted to accepted keycards
    pub fn duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    /// Number of keycards currently issued
    pub fn issued(&self) -> usize {
        self.keycards.lock().map(|k| k.len()).unwrap_or(0)
    }

    fn accepts(&self, credentials: &KeycardCredentials) -> bool {
        match credentials {
            KeycardCredentials::UsernamePassword { username, password } => {
                self.users.get(username) == Some(password)
            }
            KeycardCredentials::Token { token } => self.tokens.contains_key(token),
            KeycardCredentials::Anonymous => self.users.is_empty() && self.tokens.is_empty(),
        }
    }
}

#[async_trait]
impl Bouncer for StaticBouncer {
    async fn authenticate(&self, mut keycard: Keycard) -> Result<Option<Keycard>> {
        if !self.accepts(&keycard.credentials) {
            tracing::info!(keycard = %keycard, "Keycard refused");
            return Ok(None);
        }

        let serial = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{:016x}", serial);
        keycard.id = Some(id.clone());
        keycard.state = KeycardState::Authenticated;
        if keycard.domain.is_none() {
            keycard.domain = self.domain.clone();
        }
        keycard.duration = self.duration;

        if let Ok(mut keycards) = self.keycards.lock() {
            keycards.insert(id, keycard.clone());
        }
        tracing::debug!(keycard = %keycard, "Keycard accepted");
        Ok(Some(keycard))
    }

    async fn keep_alive(&self, issuer_name: &str, ttl: f64) -> Result<()> {
        if let Ok(mut keycards) = self.keycards.lock() {
            for keycard in keycards.values_mut() {
                if keycard.issuer_name.as_deref() == Some(issuer_name) {
                    keycard.ttl = Some(ttl);
                }
            }
        }
        Ok(())
    }

    async fn remove_keycard_id(&self, keycard_id: &str) -> Result<()> {
        let removed = self
            .keycards
            .lock()
            .map(|mut k| k.remove(keycard_id).is_some())
            .unwrap_or(false);
        if !removed {
            tracing::warn!(keycard_id = keycard_id, "Removing unknown keycard");
        }
        Ok(())
    }

    async fn expire_keycard(&self, keycard_id: &str) -> Result<Option<Keycard>> {
        Ok(self
            .keycards
            .lock()
            .ok()
            .and_then(|mut k| k.remove(keycard_id)))
    }

    async fn keycard_classes(&self) -> Result<Vec<String>> {
        let mut classes = Vec::new();
        if !self.users.is_empty() {
            classes.push("username-password".to_string());
        }
        if !self.tokens.is_empty() {
            classes.push("token".to_string());
        }
        if classes.is_empty() {
            classes.push("anonymous".to_string());
        }
        Ok(classes)
    }
}
