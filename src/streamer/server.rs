//! HTTP streaming server
//!
//! Each audience connection goes through the same steps: read the request,
//! wait for the stream to be ready, check the client budget, authenticate,
//! then write the response head and hand the connection to the [`Sink`].
//! From then on the sink owns it; the streamer only hears back when the
//! client leaves.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::access::{AccessEntry, AccessLog};
use super::config::{IssuerKind, StreamerConfig};
use super::http::{self, HttpError, Request, Response};
use super::sink::{ClientRemoved, Sink};
use super::stats::{LoadData, Stats, StreamStats};
use super::{admin, mime, resource};
use crate::auth::{Bouncer, Keycard, KeycardCredentials};
use crate::config::ConfigError;
use crate::error::Result;

/// An admitted audience client
struct Client {
    peer: SocketAddr,
    request: Request,
    keycard: Option<Keycard>,
    duration: Option<AbortHandle>,
}

struct StreamerState {
    clients: HashMap<u64, Client>,
    /// Keycard id to client id
    keycards: HashMap<String, u64>,
    /// Clients past the budget check but not yet streaming
    admitting: usize,
    stats: Stats,
}

/// A place under the client budget, held while a client is admitted
struct Slot<'a> {
    streamer: &'a Streamer,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        let mut state = self.streamer.lock();
        state.admitting = state.admitting.saturating_sub(1);
    }
}

pub struct Streamer {
    config: StreamerConfig,
    sink: Arc<Sink>,
    bouncer: Option<Arc<dyn Bouncer>>,
    state: Mutex<StreamerState>,
    log: AccessLog,
    fd_limit: u64,
    next_client_id: AtomicU64,
    weak: Weak<Streamer>,
}

impl Streamer {
    /// Create a streamer; `bouncer` is required when the config names one
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: StreamerConfig, bouncer: Option<Arc<dyn Bouncer>>) -> Result<Arc<Self>> {
        if let (Some(name), None) = (&config.bouncer, &bouncer) {
            return Err(ConfigError::Invalid(format!(
                "streamer {} names bouncer {} but none was given",
                config.name, name
            ))
            .into());
        }
        let log = match &config.access_log {
            Some(path) => AccessLog::open(path)?,
            None => AccessLog::disabled(),
        };
        let fd_limit = resource::soft_fd_limit().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Cannot read open files limit");
            u64::MAX
        });
        let (sink, removed) = Sink::new(config.client_backlog);

        let streamer = Arc::new_cyclic(|weak| Self {
            config,
            sink,
            bouncer,
            state: Mutex::new(StreamerState {
                clients: HashMap::new(),
                keycards: HashMap::new(),
                admitting: 0,
                stats: Stats::new(Instant::now()),
            }),
            log,
            fd_limit,
            next_client_id: AtomicU64::new(1),
            weak: weak.clone(),
        });
        tokio::spawn(run_removals(Arc::downgrade(&streamer), removed));
        Ok(streamer)
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    /// The sink the pipeline feeds
    pub fn sink(&self) -> &Arc<Sink> {
        &self.sink
    }

    fn lock(&self) -> MutexGuard<'_, StreamerState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn max_allowed_clients(&self) -> usize {
        resource::max_allowed_clients(
            self.config.max_clients,
            self.fd_limit,
            self.config.reserved_fds,
        )
    }

    fn try_admit(&self) -> Option<Slot<'_>> {
        let max = self.max_allowed_clients();
        let mut state = self.lock();
        if state.clients.len() + state.admitting >= max {
            return None;
        }
        state.admitting += 1;
        Some(Slot { streamer: self })
    }

    pub fn stats(&self) -> StreamStats {
        let max = self.max_allowed_clients();
        let received = self.sink.bytes_to_serve();
        let sent = self.sink.bytes_served();
        self.lock()
            .stats
            .snapshot(Instant::now(), self.sink.caps(), received, sent, max)
    }

    pub fn load_data(&self) -> LoadData {
        let received = self.sink.bytes_to_serve();
        let sent = self.sink.bytes_served();
        self.lock().stats.load_data(Instant::now(), received, sent)
    }

    /// Reopen the access log file
    pub fn rotate_log(&self) -> Result<()> {
        Ok(self.log.rotate()?)
    }

    fn tick_stats(&self) {
        let received = self.sink.bytes_to_serve();
        self.lock().stats.tick(Instant::now(), received);
    }

    // ---- serving

    /// Run the server
    ///
    /// This method blocks until the listener fails.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(self: &Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, mount = %self.config.mount_point, "Streamer listening");

        let ticker = {
            let weak = self.weak.clone();
            let interval = self.config.stats_interval;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tick.tick().await;
                    let Some(streamer) = weak.upgrade() else {
                        break;
                    };
                    streamer.tick_stats();
                }
            })
        };

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        };

        ticker.abort();
        self.sink.remove_all();
        result
    }

    async fn accept_loop(self: &Arc<Self>, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    if self.config.tcp_nodelay {
                        if let Err(e) = socket.set_nodelay(true) {
                            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                    }
                    let streamer = Arc::clone(self);
                    tokio::spawn(async move { streamer.serve_connection(socket, peer).await });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Handle one audience connection from `peer`
    pub async fn serve_connection<S>(self: &Arc<Self>, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let read = tokio::time::timeout(
            self.config.request_timeout,
            http::read_request(&mut reader),
        )
        .await;
        let request = match read {
            Ok(Ok(request)) => request,
            Ok(Err(HttpError::Malformed(reason))) => {
                tracing::debug!(peer = %peer, reason = %reason, "Malformed request");
                respond(&mut writer, &Response::error(400), false).await;
                return;
            }
            Ok(Err(e)) => {
                tracing::debug!(peer = %peer, error = %e, "No request from client");
                return;
            }
            Err(_) => {
                tracing::debug!(peer = %peer, "Client sent no request in time");
                return;
            }
        };
        let head_only = request.method == "HEAD";
        tracing::info!(peer = %peer, method = %request.method, uri = %request.uri, "Incoming client connection");

        if request.path == "/admin" {
            let response = self.admin_response(&request, peer);
            respond(&mut writer, &response, head_only).await;
            return;
        }
        if !self.config.is_mounted(&request.path) {
            respond(&mut writer, &Response::error(404), head_only).await;
            return;
        }
        if request.method != "GET" && !head_only {
            respond(&mut writer, &Response::error(405), false).await;
            return;
        }

        if !self.sink.is_ready() {
            tracing::debug!(peer = %peer, "Stream not ready, holding client");
            tokio::select! {
                _ = self.sink.ready() => {}
                _ = hangup(&mut reader) => {
                    tracing::debug!(peer = %peer, "Client left before stream was ready");
                    return;
                }
            }
        }

        let Some(slot) = self.try_admit() else {
            tracing::info!(peer = %peer, limit = self.max_allowed_clients(), "Refusing client, limit reached");
            respond(&mut writer, &Response::error(503), head_only).await;
            return;
        };

        let Some(keycard) = self.authenticate(&request, peer).await else {
            tracing::info!(peer = %peer, "Client is unauthorized");
            let realm = self
                .config
                .domain
                .clone()
                .unwrap_or_else(|| self.config.name.clone());
            let response = Response::error(401)
                .header("WWW-Authenticate", format!("Basic realm=\"{}\"", realm));
            respond(&mut writer, &response, head_only).await;
            return;
        };

        let Some(caps) = self.sink.caps() else {
            return;
        };
        let head = self.stream_head(&caps);
        if head_only {
            respond(&mut writer, &head, true).await;
            self.forget_keycard(&keycard).await;
            return;
        }
        if let Err(e) = writer.write_all(&head.encode(true)).await {
            tracing::info!(peer = %peer, error = %e, "Client gone before writing header");
            self.forget_keycard(&keycard).await;
            return;
        }

        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let duration = keycard.duration();
        {
            let mut state = self.lock();
            let state = &mut *state;
            if self.bouncer.is_some() {
                if let Some(keycard_id) = &keycard.id {
                    state.keycards.insert(keycard_id.clone(), id);
                }
            }
            state.clients.insert(
                id,
                Client {
                    peer,
                    request,
                    keycard: Some(keycard),
                    duration: None,
                },
            );
            state.stats.client_added(Instant::now());
        }
        drop(slot);
        self.sink.add_client(id, reader, writer);
        tracing::info!(client = id, peer = %peer, "Started streaming");

        if let Some(duration) = duration {
            self.schedule_expiry(id, duration);
        }
    }

    fn stream_head(&self, caps: &str) -> Response {
        let mut head = Response::new(200)
            .header("Server", http::server_name())
            .header("Date", http::http_date(Utc::now()))
            .header("Cache-Control", "no-cache")
            .header("Cache-Control", "private")
            .header("Content-Type", mime::content_type(caps));
        if mime::needs_broadcast_pragma(caps) {
            head = head.header("Pragma", "features=broadcast");
        }
        head
    }

    fn admin_response(&self, request: &Request, peer: SocketAddr) -> Response {
        let authorized = admin::is_authorized(
            request,
            peer.ip(),
            &self.config.admin_user,
            self.config.admin_password.as_deref(),
        );
        if !authorized {
            tracing::debug!(peer = %peer, "Unauthorized request for /admin");
            return Response::error(401).header("WWW-Authenticate", "Basic realm=\"Restricted Access\"");
        }
        let page = admin::render(&self.config.name, &self.stats());
        Response::new(200)
            .header("Server", http::server_name())
            .header("Content-Type", "text/html")
            .body(page)
    }

    // ---- authentication

    /// Keycard for `request`, or `None` when the issuer has nothing to go on
    fn issue(&self, request: &Request, peer: SocketAddr) -> Option<Keycard> {
        let keycard = match self.config.issuer {
            IssuerKind::HttpAuth => match request.basic_credentials() {
                Some((username, password)) => Keycard::username_password(username, password),
                None => Keycard::new(KeycardCredentials::Anonymous),
            },
            IssuerKind::HttpToken => Keycard::token(request.query_param("token")?),
        };
        Some(keycard.address(peer.ip().to_string()))
    }

    async fn authenticate(&self, request: &Request, peer: SocketAddr) -> Option<Keycard> {
        let mut keycard = self
            .issue(request, peer)?
            .requester(self.config.name.clone())
            .issuer(self.config.name.clone());
        let Some(bouncer) = &self.bouncer else {
            return Some(keycard);
        };

        keycard.domain = self.config.domain.clone();
        tracing::debug!(keycard = %keycard, bouncer = ?self.config.bouncer, "Sending keycard to bouncer");
        match bouncer.authenticate(keycard).await {
            Ok(Some(keycard)) => Some(keycard),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Bouncer failed, refusing client");
                None
            }
        }
    }

    async fn forget_keycard(&self, keycard: &Keycard) {
        let Some(bouncer) = &self.bouncer else {
            return;
        };
        if let Err(e) = bouncer.remove_keycard(keycard).await {
            tracing::warn!(keycard = %keycard, error = %e, "Failed to remove keycard");
        }
    }

    // ---- expiry

    fn schedule_expiry(&self, id: u64, duration: Duration) {
        tracing::debug!(client = id, seconds = duration.as_secs_f64(), "Client will expire");
        let weak = self.weak.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(streamer) = weak.upgrade() {
                streamer.duration_expired(id);
            }
        })
        .abort_handle();

        let mut state = self.lock();
        match state.clients.get_mut(&id) {
            Some(client) => client.duration = Some(timer),
            // Already gone
            None => timer.abort(),
        }
    }

    fn duration_expired(&self, id: u64) {
        if let Some(client) = self.lock().clients.get_mut(&id) {
            client.duration = None;
        }
        tracing::debug!(client = id, "Duration exceeded, expiring client");
        self.sink.remove_client(id);
    }

    /// Drop the client holding `keycard_id`; false if there is none
    pub fn expire_keycard(&self, keycard_id: &str) -> bool {
        let id = {
            let mut state = self.lock();
            let Some(&id) = state.keycards.get(keycard_id) else {
                tracing::warn!(keycard_id = keycard_id, "Expiring unknown keycard");
                return false;
            };
            if let Some(timer) = state.clients.get_mut(&id).and_then(|c| c.duration.take()) {
                timer.abort();
            }
            id
        };
        tracing::debug!(client = id, keycard_id = keycard_id, "Expiring client");
        self.sink.remove_client(id)
    }

    /// Expire several keycards; returns how many clients were dropped
    pub fn expire_keycards(&self, keycard_ids: &[String]) -> usize {
        keycard_ids
            .iter()
            .filter(|id| self.expire_keycard(id))
            .count()
    }

    // ---- removal

    async fn client_removed(&self, event: ClientRemoved) {
        let client = {
            let mut state = self.lock();
            let Some(client) = state.clients.remove(&event.id) else {
                tracing::warn!(client = event.id, "Removed client not found");
                return;
            };
            if let Some(keycard_id) = client.keycard.as_ref().and_then(|k| k.id.as_ref()) {
                state.keycards.remove(keycard_id);
            }
            state.stats.client_removed(Instant::now());
            client
        };
        if let Some(timer) = &client.duration {
            timer.abort();
        }

        self.log.write(&AccessEntry {
            ip: client.peer.ip().to_string(),
            time: Utc::now(),
            request: &client.request,
            status: 200,
            bytes_sent: Some(event.stats.bytes_sent),
            connected: Some(event.stats.connected),
        });
        tracing::info!(
            client = event.id,
            peer = %client.peer,
            reason = %event.reason,
            bytes = event.stats.bytes_sent,
            "Client disconnected"
        );

        if let Some(keycard) = &client.keycard {
            self.forget_keycard(keycard).await;
        }
    }
}

async fn run_removals(weak: Weak<Streamer>, mut events: mpsc::UnboundedReceiver<ClientRemoved>) {
    while let Some(event) = events.recv().await {
        let Some(streamer) = weak.upgrade() else {
            break;
        };
        streamer.client_removed(event).await;
    }
}

/// Resolves once the client closes its end
async fn hangup<R: AsyncRead + Unpin>(reader: &mut R) {
    let mut scratch = [0u8; 256];
    loop {
        match reader.read(&mut scratch).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

async fn respond<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response, head_only: bool) {
    let result = async {
        writer.write_all(&response.encode(head_only)).await?;
        writer.shutdown().await
    }
    .await;
    if let Err(e) = result {
        tracing::debug!(code = response.code, error = %e, "Failed to write response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticBouncer;
    use bytes::Bytes;
    use tokio::io::{duplex, DuplexStream};

    const REMOTE: &str = "10.0.0.5:40000";

    fn streamer(config: StreamerConfig) -> Arc<Streamer> {
        Streamer::new(config, None).unwrap()
    }

    fn guarded(config: StreamerConfig, bouncer: &Arc<StaticBouncer>) -> Arc<Streamer> {
        let shared: Arc<dyn Bouncer> = bouncer.clone();
        Streamer::new(config.bouncer("bouncer"), Some(shared)).unwrap()
    }

    /// Open a connection from `peer` that has already sent `raw`
    async fn connect(streamer: &Arc<Streamer>, peer: &str, raw: &str) -> DuplexStream {
        let (mut client, server) = duplex(64 * 1024);
        client.write_all(raw.as_bytes()).await.unwrap();
        let streamer = Arc::clone(streamer);
        let peer: SocketAddr = peer.parse().unwrap();
        tokio::spawn(async move { streamer.serve_connection(server, peer).await });
        client
    }

    async fn read_head(client: &mut DuplexStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    async fn read_all(client: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_streams_after_headers() {
        let streamer = streamer(StreamerConfig::default());
        streamer.sink().set_caps("application/ogg");

        let mut client = connect(&streamer, REMOTE, "GET / HTTP/1.0\r\n\r\n").await;
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(head.contains("Server: MediaplanetHTTPServer/"));
        assert!(head.contains("Cache-Control: no-cache\r\nCache-Control: private\r\n"));
        assert!(head.contains("Content-Type: application/ogg\r\n"));
        assert!(!head.contains("Pragma"));

        while streamer.sink().client_count() == 0 {
            tokio::task::yield_now().await;
        }
        streamer.sink().push(Bytes::from_static(b"OggS"));
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"OggS");
        assert_eq!(streamer.client_count(), 1);
        assert_eq!(streamer.stats().current_clients, 1);
    }

    #[tokio::test]
    async fn test_asf_gets_pragma() {
        let streamer = streamer(StreamerConfig::default());
        streamer.sink().set_caps("video/x-ms-asf");

        let mut client = connect(&streamer, REMOTE, "GET / HTTP/1.0\r\n\r\n").await;
        let head = read_head(&mut client).await;
        assert!(head.contains("Pragma: features=broadcast\r\n"));
    }

    #[tokio::test]
    async fn test_head_returns_only_headers() {
        let streamer = streamer(StreamerConfig::default());
        streamer.sink().set_caps("audio/mpeg");

        let mut client = connect(&streamer, REMOTE, "HEAD / HTTP/1.0\r\n\r\n").await;
        let response = read_all(&mut client).await;
        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(response.contains("Content-Type: audio/mpeg\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
        assert_eq!(streamer.client_count(), 0);
    }

    #[tokio::test]
    async fn test_not_found_outside_mount() {
        let streamer = streamer(StreamerConfig::default().mount("/live.ogg"));
        streamer.sink().set_caps("application/ogg");

        let mut client = connect(&streamer, REMOTE, "GET /other HTTP/1.0\r\n\r\n").await;
        assert!(read_all(&mut client).await.starts_with("HTTP/1.0 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn test_held_until_ready() {
        let streamer = streamer(StreamerConfig::default());
        let mut client = connect(&streamer, REMOTE, "GET / HTTP/1.0\r\n\r\n").await;

        let mut byte = [0u8; 1];
        let early =
            tokio::time::timeout(Duration::from_millis(50), client.read_exact(&mut byte)).await;
        assert!(early.is_err());

        streamer.sink().set_caps("video/webm");
        let head = read_head(&mut client).await;
        assert!(head.contains("Content-Type: video/webm\r\n"));
    }

    #[tokio::test]
    async fn test_admission_cap() {
        let streamer = streamer(StreamerConfig::default().max_clients(1));
        streamer.sink().set_caps("application/ogg");

        let mut first = connect(&streamer, REMOTE, "GET / HTTP/1.0\r\n\r\n").await;
        assert!(read_head(&mut first).await.starts_with("HTTP/1.0 200 OK"));
        while streamer.client_count() == 0 {
            tokio::task::yield_now().await;
        }

        let mut second = connect(&streamer, REMOTE, "GET / HTTP/1.0\r\n\r\n").await;
        let refused = read_all(&mut second).await;
        assert!(refused.starts_with("HTTP/1.0 503 Service Unavailable\r\n"));
        assert!(refused.contains("<h2>503 Service Unavailable</h2>"));
    }

    #[tokio::test]
    async fn test_unauthorized_gets_challenge() {
        let bouncer = Arc::new(StaticBouncer::new().user("user", "test"));
        let streamer = guarded(StreamerConfig::default().domain("studio"), &bouncer);
        streamer.sink().set_caps("application/ogg");

        let mut client = connect(&streamer, REMOTE, "GET / HTTP/1.0\r\n\r\n").await;
        let response = read_all(&mut client).await;
        assert!(response.starts_with("HTTP/1.0 401 Unauthorized\r\n"));
        assert!(response.contains("WWW-Authenticate: Basic realm=\"studio\"\r\n"));
    }

    #[tokio::test]
    async fn test_keycard_removed_with_client() {
        let bouncer = Arc::new(StaticBouncer::new().user("user", "test"));
        let streamer = guarded(StreamerConfig::default(), &bouncer);
        streamer.sink().set_caps("application/ogg");

        // user:test
        let mut client = connect(
            &streamer,
            REMOTE,
            "GET / HTTP/1.0\r\nAuthorization: Basic dXNlcjp0ZXN0\r\n\r\n",
        )
        .await;
        assert!(read_head(&mut client).await.starts_with("HTTP/1.0 200 OK"));
        assert_eq!(bouncer.issued(), 1);

        drop(client);
        while bouncer.issued() > 0 || streamer.client_count() > 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_token_issuer() {
        let bouncer = Arc::new(StaticBouncer::new().token("s3cret", "alice"));
        let streamer = guarded(
            StreamerConfig::default().issuer(IssuerKind::HttpToken),
            &bouncer,
        );
        streamer.sink().set_caps("application/ogg");

        let mut missing = connect(&streamer, REMOTE, "GET / HTTP/1.0\r\n\r\n").await;
        assert!(read_all(&mut missing).await.starts_with("HTTP/1.0 401"));

        let mut client = connect(&streamer, REMOTE, "GET /?token=s3cret HTTP/1.0\r\n\r\n").await;
        assert!(read_head(&mut client).await.starts_with("HTTP/1.0 200 OK"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_expires_client() {
        let bouncer = Arc::new(StaticBouncer::new().user("user", "test").duration(2.0));
        let streamer = guarded(StreamerConfig::default(), &bouncer);
        streamer.sink().set_caps("application/ogg");

        let started = tokio::time::Instant::now();
        let mut client = connect(
            &streamer,
            REMOTE,
            "GET / HTTP/1.0\r\nAuthorization: Basic dXNlcjp0ZXN0\r\n\r\n",
        )
        .await;
        read_head(&mut client).await;

        // Sink closes the connection once the keycard runs out
        read_all(&mut client).await;
        assert!(started.elapsed() >= Duration::from_secs(2));
        while bouncer.issued() > 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_expire_keycard() {
        let bouncer = Arc::new(StaticBouncer::new().user("user", "test"));
        let streamer = guarded(StreamerConfig::default(), &bouncer);
        streamer.sink().set_caps("application/ogg");

        let mut client = connect(
            &streamer,
            REMOTE,
            "GET / HTTP/1.0\r\nAuthorization: Basic dXNlcjp0ZXN0\r\n\r\n",
        )
        .await;
        read_head(&mut client).await;
        while streamer.client_count() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(streamer.expire_keycard("0000000000000001"));
        read_all(&mut client).await;
        assert!(!streamer.expire_keycard("0000000000000001"));
        assert!(!streamer.expire_keycard("ffff"));
    }

    #[tokio::test]
    async fn test_admin_page() {
        let streamer = streamer(StreamerConfig::named("/f/http").admin_password("pw"));
        streamer.sink().set_caps("application/ogg");

        let mut local = connect(&streamer, "127.0.0.1:40000", "GET /admin HTTP/1.0\r\n\r\n").await;
        let page = read_all(&mut local).await;
        assert!(page.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(page.contains("<title>Statistics for /f/http</title>"));

        let mut remote = connect(&streamer, REMOTE, "GET /admin HTTP/1.0\r\n\r\n").await;
        let refused = read_all(&mut remote).await;
        assert!(refused.starts_with("HTTP/1.0 401"));
        assert!(refused.contains("WWW-Authenticate: Basic realm=\"Restricted Access\""));
    }

    #[tokio::test]
    async fn test_access_log_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let streamer = streamer(StreamerConfig::default().access_log(&path));
        streamer.sink().set_caps("application/ogg");

        let mut client = connect(
            &streamer,
            REMOTE,
            "GET /?x=1 HTTP/1.1\r\nUser-Agent: vlc/3.0\r\n\r\n",
        )
        .await;
        read_head(&mut client).await;
        while streamer.client_count() == 0 {
            tokio::task::yield_now().await;
        }
        drop(client);
        while streamer.client_count() > 0 {
            tokio::task::yield_now().await;
        }

        let log = std::fs::read_to_string(&path).unwrap();
        assert!(log.starts_with("10.0.0.5 - - ["));
        assert!(log.contains("\"GET /?x=1 HTTP/1.1\" 200 0 \"-\" \"vlc/3.0\" 0"));
    }

    #[tokio::test]
    async fn test_bouncer_name_requires_bouncer() {
        let result = Streamer::new(StreamerConfig::default().bouncer("missing"), None);
        assert!(result.is_err());
    }
}
