//! Audience scenarios against an in-process streamer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mediaplanet::auth::{Bouncer, StaticBouncer};
use mediaplanet::streamer::{Streamer, StreamerConfig};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

const GET: &str = "GET / HTTP/1.0\r\n\r\n";
// user:test
const GET_AS_USER: &str = "GET / HTTP/1.0\r\nAuthorization: Basic dXNlcjp0ZXN0\r\n\r\n";

async fn connect(streamer: &Arc<Streamer>, port: u16, raw: &str) -> DuplexStream {
    let (mut client, server) = duplex(64 * 1024);
    client.write_all(raw.as_bytes()).await.unwrap();
    let streamer = Arc::clone(streamer);
    let peer = SocketAddr::from(([192, 168, 1, 10], port));
    tokio::spawn(async move { streamer.serve_connection(server, peer).await });
    client
}

async fn status_line(client: &mut DuplexStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while !line.ends_with(b"\r\n") {
        client.read_exact(&mut byte).await.unwrap();
        line.push(byte[0]);
    }
    String::from_utf8(line).unwrap().trim_end().to_string()
}

#[tokio::test]
async fn test_fourth_client_over_cap_is_refused() {
    let streamer = Streamer::new(StreamerConfig::default().max_clients(3), None).unwrap();
    streamer.sink().set_caps("application/ogg");

    let mut clients = Vec::new();
    for port in 0..4 {
        clients.push(connect(&streamer, 50_000 + port, GET).await);
    }

    let mut statuses = Vec::new();
    for client in &mut clients {
        statuses.push(status_line(client).await);
    }
    statuses.sort();
    assert_eq!(
        statuses,
        vec![
            "HTTP/1.0 200 OK",
            "HTTP/1.0 200 OK",
            "HTTP/1.0 200 OK",
            "HTTP/1.0 503 Service Unavailable",
        ]
    );

    while streamer.sink().client_count() < 3 {
        tokio::task::yield_now().await;
    }
    streamer.sink().push(bytes::Bytes::from_static(b"page"));
    let mut streamed = 0;
    for client in &mut clients {
        let mut rest = [0u8; 4];
        // Skip the rest of the head
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            if client.read_exact(&mut rest[..1]).await.is_err() {
                break;
            }
            head.push(rest[0]);
        }
        if client.read_exact(&mut rest).await.is_ok() && &rest == b"page" {
            streamed += 1;
        }
    }
    assert_eq!(streamed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_keycard_duration_expires_then_readmits() {
    let bouncer = Arc::new(StaticBouncer::new().user("user", "test").duration(2.0));
    let shared: Arc<dyn Bouncer> = bouncer.clone();
    let streamer =
        Streamer::new(StreamerConfig::default().bouncer("porter"), Some(shared)).unwrap();
    streamer.sink().set_caps("audio/mpeg");
    let start = tokio::time::Instant::now();

    let mut first = connect(&streamer, 50_000, GET_AS_USER).await;
    assert_eq!(status_line(&mut first).await, "HTTP/1.0 200 OK");
    let mut rest = Vec::new();
    first.read_to_end(&mut rest).await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(2));

    while streamer.client_count() > 0 || bouncer.issued() > 0 {
        tokio::task::yield_now().await;
    }

    tokio::time::sleep_until(start + Duration::from_secs(3)).await;
    let mut second = connect(&streamer, 50_001, GET_AS_USER).await;
    assert_eq!(status_line(&mut second).await, "HTTP/1.0 200 OK");
    while streamer.client_count() == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(bouncer.issued(), 1);
}
