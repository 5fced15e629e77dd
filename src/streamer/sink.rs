//! Multi-client sink
//!
//! The pipeline pushes stream buffers into the sink; every audience
//! connection handed to it gets its own writer task fed from a
//! `tokio::sync::broadcast` channel. `Bytes` is reference counted, so all
//! clients share one allocation per buffer.
//!
//! ```text
//!   pipeline ── push(Bytes) ──► broadcast::Sender
//!                                   │
//!              ┌────────────────────┼────────────────────┐
//!              ▼                    ▼                    ▼
//!         [client 1]           [client 2]           [client 3]
//!         write_all()          write_all()          write_all()
//!              │                    │                    │
//!              └──── ClientRemoved ─┴── (id, reason, stats) ──► streamer
//! ```
//!
//! Once a connection is added the sink owns it: nothing else writes to it,
//! and it is closed when the client is removed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a client left the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    /// The client closed its connection
    Closed,
    /// Writing to the client failed
    WriteError,
    /// The client fell too far behind the stream
    Slow,
    /// Removed on request (expiry, admin action, shutdown)
    Removed,
    /// The sink itself went away
    Shutdown,
}

impl fmt::Display for RemoveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoveReason::Closed => "closed",
            RemoveReason::WriteError => "write-error",
            RemoveReason::Slow => "slow",
            RemoveReason::Removed => "removed",
            RemoveReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Per-client totals reported on removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientStats {
    pub bytes_sent: u64,
    pub connected: Duration,
}

/// Emitted once for every client that leaves the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRemoved {
    pub id: u64,
    pub reason: RemoveReason,
    pub stats: ClientStats,
}

pub struct Sink {
    tx: broadcast::Sender<Bytes>,
    caps: watch::Sender<Option<String>>,
    clients: Mutex<HashMap<u64, CancellationToken>>,
    removed: mpsc::UnboundedSender<ClientRemoved>,
    bytes_to_serve: AtomicU64,
    bytes_served: Arc<AtomicU64>,
}

impl Sink {
    /// Create a sink buffering up to `capacity` buffers per client
    ///
    /// The receiver yields a [`ClientRemoved`] for every departing client.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<ClientRemoved>) {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let (caps, _) = watch::channel(None);
        let (removed, events) = mpsc::unbounded_channel();
        let sink = Arc::new(Self {
            tx,
            caps,
            clients: Mutex::new(HashMap::new()),
            removed,
            bytes_to_serve: AtomicU64::new(0),
            bytes_served: Arc::new(AtomicU64::new(0)),
        });
        (sink, events)
    }

    /// Announce the stream's MIME type; the sink is ready from then on
    pub fn set_caps(&self, mime: impl Into<String>) {
        let mime = mime.into();
        tracing::info!(mime = %mime, "Stream caps known");
        self.caps.send_replace(Some(mime));
    }

    pub fn caps(&self) -> Option<String> {
        self.caps.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.caps.borrow().is_some()
    }

    /// Wait until caps are known
    pub async fn ready(&self) {
        let mut caps = self.caps.subscribe();
        // The sender lives as long as self, so this cannot fail
        let _ = caps.wait_for(Option::is_some).await;
    }

    /// Send a buffer to every client; returns how many clients it reached
    pub fn push(&self, buffer: Bytes) -> usize {
        self.bytes_to_serve
            .fetch_add(buffer.len() as u64, Ordering::Relaxed);
        self.tx.send(buffer).unwrap_or(0)
    }

    /// Take over a client connection
    ///
    /// Buffers pushed from now on are written to `writer`; `reader` is only
    /// watched for the client hanging up.
    pub fn add_client<R, W>(self: &Arc<Self>, id: u64, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let rx = self.tx.subscribe();
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(id, cancel.clone());
        }
        tracing::debug!(client = id, "Client added to sink");

        let sink = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let (reason, bytes_sent) =
                serve_client(rx, reader, writer, cancel, &sink.bytes_served).await;
            sink.finish(
                id,
                reason,
                ClientStats {
                    bytes_sent,
                    connected: started.elapsed(),
                },
            );
        });
    }

    /// Remove a client; returns false if it was not in the sink
    ///
    /// The removal is reported through the event channel like any other.
    pub fn remove_client(&self, id: u64) -> bool {
        let token = self
            .clients
            .lock()
            .ok()
            .and_then(|clients| clients.get(&id).cloned());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove_all(&self) {
        if let Ok(clients) = self.clients.lock() {
            for token in clients.values() {
                token.cancel();
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Total bytes pushed by the pipeline
    pub fn bytes_to_serve(&self) -> u64 {
        self.bytes_to_serve.load(Ordering::Relaxed)
    }

    /// Total bytes written to clients
    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::Relaxed)
    }

    fn finish(&self, id: u64, reason: RemoveReason, stats: ClientStats) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.remove(&id);
        }
        tracing::debug!(client = id, reason = %reason, bytes = stats.bytes_sent, "Client left sink");
        let _ = self.removed.send(ClientRemoved { id, reason, stats });
    }
}

async fn serve_client<R, W>(
    mut rx: broadcast::Receiver<Bytes>,
    mut reader: R,
    mut writer: W,
    cancel: CancellationToken,
    served: &AtomicU64,
) -> (RemoveReason, u64)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut sent = 0u64;
    let mut scratch = [0u8; 512];
    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break RemoveReason::Removed,
            read = reader.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break RemoveReason::Closed,
                // Anything the client sends after its request is ignored
                Ok(_) => continue,
            },
            buffer = rx.recv() => match buffer {
                Ok(buffer) => {
                    if writer.write_all(&buffer).await.is_err() {
                        break RemoveReason::WriteError;
                    }
                    sent += buffer.len() as u64;
                    served.fetch_add(buffer.len() as u64, Ordering::Relaxed);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped = skipped, "Client lagging behind stream");
                    break RemoveReason::Slow;
                }
                Err(RecvError::Closed) => break RemoveReason::Shutdown,
            },
        }
    };
    let _ = writer.shutdown().await;
    (reason, sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    /// Client connection whose far end the test keeps
    fn connection() -> (
        tokio::io::ReadHalf<tokio::io::DuplexStream>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
        tokio::io::DuplexStream,
    ) {
        let (ours, theirs) = duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(ours);
        (reader, writer, theirs)
    }

    #[tokio::test]
    async fn test_caps_make_sink_ready() {
        let (sink, _events) = Sink::new(16);
        assert!(!sink.is_ready());

        let waiter = {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move { sink.ready().await })
        };
        sink.set_caps("application/ogg");
        waiter.await.unwrap();
        assert_eq!(sink.caps().as_deref(), Some("application/ogg"));
    }

    #[tokio::test]
    async fn test_fan_out_to_clients() {
        let (sink, _events) = Sink::new(16);
        let (r1, w1, mut c1) = connection();
        let (r2, w2, mut c2) = connection();
        sink.add_client(1, r1, w1);
        sink.add_client(2, r2, w2);
        assert_eq!(sink.client_count(), 2);

        assert_eq!(sink.push(Bytes::from_static(b"OggS")), 2);

        let mut buf = [0u8; 4];
        c1.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"OggS");
        c2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"OggS");
        assert_eq!(sink.bytes_to_serve(), 4);
        while sink.bytes_served() < 8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_remove_client_reports_stats() {
        let (sink, mut events) = Sink::new(16);
        let (reader, writer, mut client) = connection();
        sink.add_client(7, reader, writer);

        sink.push(Bytes::from_static(b"data"));
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();

        assert!(sink.remove_client(7));
        let removed = events.recv().await.unwrap();
        assert_eq!(removed.id, 7);
        assert_eq!(removed.reason, RemoveReason::Removed);
        assert_eq!(removed.stats.bytes_sent, 4);

        // Connection is closed by the sink
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(sink.client_count(), 0);
        assert!(!sink.remove_client(7));
    }

    #[tokio::test]
    async fn test_client_hangup_detected() {
        let (sink, mut events) = Sink::new(16);
        let (reader, writer, client) = connection();
        sink.add_client(3, reader, writer);

        drop(client);
        let removed = events.recv().await.unwrap();
        assert_eq!(removed.id, 3);
        assert_eq!(removed.reason, RemoveReason::Closed);
    }

    #[tokio::test]
    async fn test_slow_client_dropped() {
        let (sink, mut events) = Sink::new(2);
        // Tiny pipe so the writer blocks after the first buffer
        let (ours, _theirs) = duplex(4);
        let (reader, writer) = tokio::io::split(ours);
        sink.add_client(9, reader, writer);

        for _ in 0..8 {
            sink.push(Bytes::from_static(b"12345678"));
        }
        let removed = events.recv().await.unwrap();
        assert_eq!(removed.reason, RemoveReason::Slow);
    }
}
