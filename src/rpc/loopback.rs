//! In-process peers
//!
//! A loopback pair gives the manager an ordinary [`RemoteRef`] whose calls
//! are delivered to a [`LoopbackPeer`] in the same process instead of over
//! a socket. Embedders use it to host peers next to the manager; the
//! scenario tests use it for fake workers and components.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::broker::{dispatch, Outgoing, Perspective, RemoteRef};
use super::message::{method_of, InterfaceTag, ManagerRequest};
use super::portal::{Portal, Realm};
use crate::auth::Credentials;
use crate::error::{Error, ErrorKind, RemoteError, Result};

/// A call from the manager delivered to a loopback peer
pub struct IncomingCall {
    body: Value,
    reply: Option<oneshot::Sender<Result<Value>>>,
    remote: RemoteRef,
}

impl IncomingCall {
    /// Method name of the call
    pub fn method(&self) -> &str {
        method_of(&self.body)
    }

    /// Encoded call body
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Decode the call into one of the typed call enums
    pub fn decode<C: DeserializeOwned>(&self) -> Result<C> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Whether the manager is waiting for a reply
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Answer the call
    pub fn respond<T: Serialize>(mut self, value: T) {
        self.remote.touch();
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Ok(value));
        }
    }

    /// Fail the call
    pub fn fail(mut self, kind: ErrorKind, message: impl Into<String>) {
        self.remote.touch();
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Err(Error::Remote(RemoteError::new(kind, message))));
        }
    }
}

/// The peer end of a loopback pair
pub struct LoopbackPeer {
    remote: RemoteRef,
    calls: mpsc::UnboundedReceiver<Outgoing>,
    perspective: Option<Arc<dyn Perspective>>,
}

impl RemoteRef {
    /// Create a connected loopback pair for a peer at `peer`
    ///
    /// Must be called from within a tokio runtime.
    pub fn loopback(peer: SocketAddr) -> (RemoteRef, LoopbackPeer) {
        let (remote, calls) = RemoteRef::new(peer);
        // No broker owns this pair, so run the hooks ourselves on disconnect
        let watcher = remote.clone();
        tokio::spawn(async move {
            watcher.closed().await;
            watcher.teardown();
        });
        let peer = LoopbackPeer {
            remote: remote.clone(),
            calls,
            perspective: None,
        };
        (remote, peer)
    }
}

impl LoopbackPeer {
    /// Log in through `portal` and start the avatar
    ///
    /// The avatar's attach work runs in the background, so the caller must
    /// keep answering [`next_call`](Self::next_call) for it to finish.
    pub async fn connect<R: Realm>(
        portal: &Portal<R>,
        peer: SocketAddr,
        credentials: Credentials,
        interface: InterfaceTag,
        avatar_id: &str,
    ) -> Result<Self> {
        let (remote, mut loopback) = RemoteRef::loopback(peer);
        let perspective = portal
            .login(&credentials, interface, avatar_id, remote)
            .await?;
        loopback.perspective = Some(Arc::clone(&perspective));
        tokio::spawn(async move { perspective.attached().await });
        Ok(loopback)
    }

    /// Manager-side handle of this peer
    pub fn remote(&self) -> &RemoteRef {
        &self.remote
    }

    /// Next call from the manager, or `None` once disconnected
    pub async fn next_call(&mut self) -> Option<IncomingCall> {
        loop {
            let outgoing = tokio::select! {
                biased;
                _ = self.remote.closed() => return None,
                outgoing = self.calls.recv() => outgoing?,
            };
            match outgoing {
                Outgoing::Call { body, reply } => {
                    return Some(IncomingCall {
                        body,
                        reply: Some(reply),
                        remote: self.remote.clone(),
                    })
                }
                Outgoing::Frame(super::frame::Frame::Notify { body }) => {
                    return Some(IncomingCall {
                        body,
                        reply: None,
                        remote: self.remote.clone(),
                    })
                }
                Outgoing::Frame(_) => continue,
                Outgoing::Close => {
                    self.remote.teardown();
                    return None;
                }
            }
        }
    }

    /// Call the manager as this peer
    pub async fn call<T: DeserializeOwned>(&self, request: ManagerRequest) -> Result<T> {
        let perspective = self.perspective.as_ref().ok_or(Error::NotConnected)?;
        if !self.remote.is_connected() {
            return Err(Error::NotConnected);
        }
        self.remote.touch();
        let body = serde_json::to_value(&request)?;
        let value = dispatch(perspective.as_ref(), body).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Drop the connection
    pub fn close(&self) {
        self.remote.teardown();
    }
}

impl Drop for LoopbackPeer {
    fn drop(&mut self) {
        self.remote.teardown();
    }
}
