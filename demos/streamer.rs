//! HTTP streamer example
//!
//! Run with: cargo run --example streamer [STREAMER_TOML]
//!
//! Serves a synthetic stream of `audio/mpeg` buffers. Clients log in as
//! `user`/`test` and are dropped after 60 seconds. Statistics are on
//! `/admin`.
//!
//!   curl -u user:test http://localhost:8800/ > /dev/null
//!   curl http://localhost:8800/admin

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mediaplanet::auth::{Bouncer, StaticBouncer};
use mediaplanet::streamer::{Streamer, StreamerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mediaplanet=debug".parse()?),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => StreamerConfig::load(Path::new(&path))?,
        None => StreamerConfig::named("/default/http-audio").bouncer("demo-bouncer"),
    };
    let bouncer: Arc<dyn Bouncer> = Arc::new(StaticBouncer::new().user("user", "test").duration(60.0));
    let bouncer = config.bouncer.as_ref().map(|_| bouncer);
    let streamer = Streamer::new(config, bouncer)?;

    println!("Streaming on {}", streamer.config().url());

    // Stand-in for a pipeline
    let sink = Arc::clone(streamer.sink());
    tokio::spawn(async move {
        sink.set_caps("audio/mpeg");
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        let frame = Bytes::from(vec![0u8; 1600]);
        loop {
            tick.tick().await;
            sink.push(frame.clone());
        }
    });

    let listener = tokio::net::TcpListener::bind(streamer.config().bind_addr).await?;
    streamer
        .serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let stats = streamer.stats();
    println!(
        "Served {} bytes, peak {} clients",
        stats.consumption_bytes, stats.peak_clients
    );
    Ok(())
}
