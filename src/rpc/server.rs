//! RPC listener
//!
//! Accepts TCP (optionally TLS) connections, waits for the login frame and
//! hands each authenticated peer to a broker task.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_rustls::rustls::ServerConfig as TlsConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;

use super::broker::{run_broker, run_dispatcher, Outgoing, RemoteRef};
use super::frame::{Frame, FrameCodec};
use super::portal::{Portal, Realm};
use crate::auth::Credentials;
use crate::config::{ManagerConfig, Transport};
use crate::error::{Error, ErrorKind, RemoteError, Result};

/// Manager RPC server
pub struct RpcServer<R: Realm> {
    config: ManagerConfig,
    portal: Arc<Portal<R>>,
    tls: Option<TlsAcceptor>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl<R: Realm> RpcServer<R> {
    /// Create a server; loads the TLS certificate when configured for SSL
    pub fn new(config: ManagerConfig, portal: Portal<R>) -> Result<Self> {
        let tls = match &config.transport {
            Transport::Tcp => None,
            Transport::Ssl { certificate } => Some(load_tls(certificate)?),
        };
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Ok(Self {
            config,
            portal: Arc::new(portal),
            tls,
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
        })
    }

    pub fn portal(&self) -> &Arc<Portal<R>> {
        &self.portal
    }

    /// Run the server
    ///
    /// This method blocks until the listener fails.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, tls = self.tls.is_some(), "Manager listening");
        self.accept_loop(&listener).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, tls = self.tls.is_some(), "Manager listening");

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        }
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session_id = session_id, peer = %peer_addr, "New connection");

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let portal = Arc::clone(&self.portal);
        let tls = self.tls.clone();
        let login_timeout = self.config.login_timeout;

        tokio::spawn(async move {
            let _permit = permit;
            let result = match tls {
                Some(acceptor) => match acceptor.accept(socket).await {
                    Ok(stream) => serve_peer(stream, peer_addr, portal, login_timeout).await,
                    Err(e) => Err(Error::Tls(e.to_string())),
                },
                None => serve_peer(socket, peer_addr, portal, login_timeout).await,
            };

            if let Err(e) = result {
                tracing::debug!(session_id = session_id, error = %e, "Connection error");
            }
            tracing::debug!(session_id = session_id, "Connection closed");
        });
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}

/// Read the certificate chain and private key from one PEM file
fn load_tls(path: &Path) -> Result<TlsAcceptor> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| Error::Tls(format!("{}: {}", path.display(), e)))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("{}: no certificates", path.display())));
    }
    let key = PrivateKeyDer::from_pem_file(path)
        .map_err(|e| Error::Tls(format!("{}: {}", path.display(), e)))?;

    let config = TlsConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Drive one peer connection: login, then broker until it closes
pub(crate) async fn serve_peer<S, R>(
    stream: S,
    peer: SocketAddr,
    portal: Arc<Portal<R>>,
    login_timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    R: Realm,
{
    let mut framed = Framed::new(stream, FrameCodec::new());

    let (credentials, interface, avatar_id) =
        match tokio::time::timeout(login_timeout, framed.next()).await {
            Err(_) => {
                tracing::warn!(peer = %peer, "No login before timeout");
                return Ok(());
            }
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(Frame::Login {
                username,
                password,
                interface,
                avatar_id,
            }))) => (Credentials::new(username, password), interface, avatar_id),
            Ok(Some(Ok(other))) => {
                tracing::warn!(peer = %peer, frame = ?other, "Expected login frame");
                let error = RemoteError::new(ErrorKind::Protocol, "expected login");
                framed.send(Frame::Denied { error }).await?;
                return Ok(());
            }
        };

    let (remote, outgoing) = RemoteRef::new(peer);
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let broker = tokio::spawn(run_broker(framed, remote.clone(), outgoing, incoming_tx));

    match portal
        .login(&credentials, interface, &avatar_id, remote.clone())
        .await
    {
        Ok(perspective) => {
            remote.send(Outgoing::Frame(Frame::Welcome {
                avatar_id: avatar_id.clone(),
            }))?;
            tokio::spawn(run_dispatcher(
                remote.clone(),
                Arc::clone(&perspective),
                incoming_rx,
            ));
            tokio::spawn(async move { perspective.attached().await });
        }
        Err(e) => {
            tracing::warn!(peer = %peer, avatar_id = %avatar_id, error = %e, "Login failed");
            let _ = remote.send(Outgoing::Frame(Frame::Denied {
                error: e.to_remote(),
            }));
            let _ = remote.send(Outgoing::Close);
        }
    }

    broker
        .await
        .map_err(|e| Error::Protocol(format!("broker task failed: {}", e)))
}
