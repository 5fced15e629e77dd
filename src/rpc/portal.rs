//! Login portal
//!
//! Checks credentials, names the peer and asks the realm for an avatar
//! matching the interface the peer requested.

use std::sync::Arc;

use async_trait::async_trait;

use super::broker::{Perspective, RemoteRef};
use super::message::InterfaceTag;
use crate::auth::{CredentialChecker, Credentials, HostIdentityProvider, Identity, IdentityProvider};
use crate::error::Result;

/// Hands out avatars to authenticated peers
#[async_trait]
pub trait Realm: Send + Sync + 'static {
    /// Create the avatar for `avatar_id` in the heaven selected by
    /// `interface`
    ///
    /// Must fail with `AlreadyConnected` if that avatar is logged in.
    async fn request_avatar(
        self: Arc<Self>,
        identity: Identity,
        interface: InterfaceTag,
        avatar_id: &str,
        remote: RemoteRef,
    ) -> Result<Arc<dyn Perspective>>;
}

pub struct Portal<R: Realm> {
    realm: Arc<R>,
    checker: CredentialChecker,
    identities: Arc<dyn IdentityProvider>,
}

impl<R: Realm> Portal<R> {
    pub fn new(realm: Arc<R>, checker: CredentialChecker) -> Self {
        Self {
            realm,
            checker,
            identities: Arc::new(HostIdentityProvider),
        }
    }

    /// Replace the default `username@host` identities
    pub fn with_identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identities = provider;
        self
    }

    pub fn realm(&self) -> &Arc<R> {
        &self.realm
    }

    /// Authenticate a peer and produce its avatar
    pub async fn login(
        &self,
        credentials: &Credentials,
        interface: InterfaceTag,
        avatar_id: &str,
        remote: RemoteRef,
    ) -> Result<Arc<dyn Perspective>> {
        let peer = remote.peer();
        if let Err(e) = self.checker.check(credentials) {
            tracing::warn!(peer = %peer, username = %credentials.username, error = %e, "Login refused");
            return Err(e);
        }

        let identity = self.identities.identity(credentials, peer.ip());
        tracing::info!(
            identity = %identity,
            interface = %interface,
            avatar_id = avatar_id,
            "Peer logging in"
        );
        Arc::clone(&self.realm)
            .request_avatar(identity, interface, avatar_id, remote)
            .await
    }
}
