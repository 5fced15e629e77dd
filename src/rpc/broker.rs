//! Remote references and the per-connection broker
//!
//! A [`RemoteRef`] is the manager's handle on one logged-in peer. Calls made
//! through it flow over an mpsc channel to the broker task that owns the
//! transport; replies come back through oneshot channels keyed by call id.
//!
//! ```text
//!  call_remote ──► mpsc ──► broker ──► Frame::Call ──► peer
//!       ▲                     │
//!       └──── oneshot ◄───────┘◄── Frame::Answer / Frame::Failure
//! ```
//!
//! Calls from the peer are queued to a dispatcher task that feeds them to
//! the avatar's [`Perspective`] one at a time, so replies leave in the order
//! the calls arrived.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::frame::{Frame, FrameCodec};
use super::message::{method_of, ManagerRequest};
use crate::error::{Error, ErrorKind, RemoteError, Result};

/// The manager-side object a logged-in peer talks to
#[async_trait]
pub trait Perspective: Send + Sync {
    /// Handle one request from the peer
    async fn perform(&self, request: ManagerRequest) -> std::result::Result<Value, RemoteError>;

    /// Called once the peer has been welcomed
    async fn attached(&self) {}
}

pub(crate) enum Outgoing {
    Call {
        body: Value,
        reply: oneshot::Sender<Result<Value>>,
    },
    Frame(Frame),
    Close,
}

type Hook = Box<dyn FnOnce() + Send>;

struct RemoteInner {
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Outgoing>,
    closed: CancellationToken,
    hooks: Mutex<Option<Vec<Hook>>>,
    last_heard: Mutex<Instant>,
}

/// Handle on a connected peer
#[derive(Clone)]
pub struct RemoteRef {
    inner: Arc<RemoteInner>,
}

impl fmt::Debug for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteRef")
            .field("peer", &self.inner.peer)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl RemoteRef {
    pub(crate) fn new(peer: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let remote = Self {
            inner: Arc::new(RemoteInner {
                peer,
                tx,
                closed: CancellationToken::new(),
                hooks: Mutex::new(Some(Vec::new())),
                last_heard: Mutex::new(Instant::now()),
            }),
        };
        (remote, rx)
    }

    /// Address of the peer
    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Peer IP as a string
    pub fn host(&self) -> String {
        self.inner.peer.ip().to_string()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.closed.is_cancelled()
    }

    /// Whether two handles refer to the same connection
    pub fn same_peer(&self, other: &RemoteRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Call a method on the peer and wait for its reply
    pub async fn call_remote<C, R>(&self, call: &C) -> Result<R>
    where
        C: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let body = serde_json::to_value(call)?;
        let method = method_of(&body).to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .tx
            .send(Outgoing::Call {
                body,
                reply: reply_tx,
            })
            .map_err(|_| Error::NotConnected)?;

        let value = tokio::select! {
            reply = reply_rx => reply.map_err(|_| Error::ConnectionLost)??,
            _ = self.inner.closed.cancelled() => return Err(Error::ConnectionLost),
        };
        serde_json::from_value(value).map_err(|e| {
            Error::Remote(RemoteError::new(
                ErrorKind::RemoteMethod,
                format!("bad reply to {}: {}", method, e),
            ))
        })
    }

    /// Send a call without waiting for a reply
    pub fn notify<C: Serialize + ?Sized>(&self, call: &C) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let body = serde_json::to_value(call)?;
        self.send(Outgoing::Frame(Frame::Notify { body }))
    }

    pub(crate) fn send(&self, outgoing: Outgoing) -> Result<()> {
        self.inner
            .tx
            .send(outgoing)
            .map_err(|_| Error::NotConnected)
    }

    /// Register a hook that runs once when the peer goes away
    ///
    /// If the peer is already gone the hook runs immediately.
    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut hooks = match self.inner.hooks.lock() {
            Ok(hooks) => hooks,
            Err(poisoned) => poisoned.into_inner(),
        };
        match hooks.as_mut() {
            Some(pending) => pending.push(Box::new(hook)),
            None => {
                drop(hooks);
                hook();
            }
        }
    }

    /// Close the transport; disconnect hooks fire once the broker stops
    pub fn disconnect(&self) {
        self.inner.closed.cancel();
    }

    /// Resolves once the peer is gone
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Mark the peer as gone and run disconnect hooks, once
    pub(crate) fn teardown(&self) {
        self.inner.closed.cancel();
        let hooks = {
            let mut hooks = match self.inner.hooks.lock() {
                Ok(hooks) => hooks,
                Err(poisoned) => poisoned.into_inner(),
            };
            hooks.take()
        };
        if let Some(hooks) = hooks {
            tracing::debug!(peer = %self.inner.peer, hooks = hooks.len(), "Peer disconnected");
            for hook in hooks {
                hook();
            }
        }
    }

    /// When anything was last received from the peer
    pub fn last_heard(&self) -> Instant {
        match self.inner.last_heard.lock() {
            Ok(at) => *at,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn touch(&self) {
        let mut at = match self.inner.last_heard.lock() {
            Ok(at) => at,
            Err(poisoned) => poisoned.into_inner(),
        };
        *at = Instant::now();
    }
}

/// A call from the peer awaiting dispatch
pub(crate) struct Incoming {
    pub id: Option<u64>,
    pub body: Value,
}

/// Decode a request body and run it against a perspective
pub(crate) async fn dispatch(
    perspective: &dyn Perspective,
    body: Value,
) -> std::result::Result<Value, RemoteError> {
    let method = method_of(&body).to_string();
    let request: ManagerRequest = serde_json::from_value(body).map_err(|e| {
        RemoteError::new(
            ErrorKind::RemoteMethod,
            format!("cannot handle {}: {}", method, e),
        )
    })?;
    perspective.perform(request).await
}

/// Feed queued calls to `perspective` in arrival order
pub(crate) async fn run_dispatcher(
    remote: RemoteRef,
    perspective: Arc<dyn Perspective>,
    mut incoming: mpsc::UnboundedReceiver<Incoming>,
) {
    while let Some(Incoming { id, body }) = incoming.recv().await {
        let method = method_of(&body).to_string();
        let outcome = dispatch(perspective.as_ref(), body).await;
        match (id, outcome) {
            (Some(id), Ok(result)) => {
                let _ = remote.send(Outgoing::Frame(Frame::Answer { id, result }));
            }
            (Some(id), Err(error)) => {
                tracing::debug!(peer = %remote.peer(), method = %method, error = %error, "Call failed");
                let _ = remote.send(Outgoing::Frame(Frame::Failure { id, error }));
            }
            (None, Err(error)) => {
                tracing::debug!(peer = %remote.peer(), method = %method, error = %error, "Notification failed");
            }
            (None, Ok(_)) => {}
        }
    }
}

/// Own a framed transport until either side closes it
///
/// On exit every pending call fails with `ConnectionLost` and the remote's
/// disconnect hooks run.
pub(crate) async fn run_broker<S>(
    framed: Framed<S, FrameCodec>,
    remote: RemoteRef,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    incoming: mpsc::UnboundedSender<Incoming>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = framed.split();
    let mut pending: HashMap<u64, oneshot::Sender<Result<Value>>> = HashMap::new();
    let mut next_id: u64 = 1;
    let closed = remote.inner.closed.clone();

    loop {
        tokio::select! {
            biased;

            _ = closed.cancelled() => {
                tracing::debug!(peer = %remote.peer(), "Closing transport");
                break;
            }

            frame = stream.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        tracing::warn!(peer = %remote.peer(), error = %e, "Dropping peer after bad frame");
                        break;
                    }
                    None => break,
                };
                remote.touch();
                match frame {
                    Frame::Call { id, body } => {
                        let _ = incoming.send(Incoming { id: Some(id), body });
                    }
                    Frame::Notify { body } => {
                        let _ = incoming.send(Incoming { id: None, body });
                    }
                    Frame::Answer { id, result } => match pending.remove(&id) {
                        Some(reply) => {
                            let _ = reply.send(Ok(result));
                        }
                        None => tracing::debug!(peer = %remote.peer(), id = id, "Answer for unknown call"),
                    },
                    Frame::Failure { id, error } => match pending.remove(&id) {
                        Some(reply) => {
                            let _ = reply.send(Err(Error::Remote(error)));
                        }
                        None => tracing::debug!(peer = %remote.peer(), id = id, "Failure for unknown call"),
                    },
                    other => {
                        tracing::warn!(peer = %remote.peer(), frame = ?other, "Unexpected frame after login");
                        break;
                    }
                }
            }

            out = outgoing.recv() => {
                let frame = match out {
                    Some(Outgoing::Call { body, reply }) => {
                        let id = next_id;
                        next_id += 1;
                        pending.insert(id, reply);
                        Frame::Call { id, body }
                    }
                    Some(Outgoing::Frame(frame)) => frame,
                    Some(Outgoing::Close) | None => {
                        let _ = sink.flush().await;
                        break;
                    }
                };
                if let Err(e) = sink.send(frame).await {
                    tracing::debug!(peer = %remote.peer(), error = %e, "Write failed");
                    break;
                }
            }
        }
    }

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(Error::ConnectionLost));
    }
    let _ = sink.close().await;
    remote.teardown();
}
