//! Liveness pings
//!
//! Every avatar pings its peer each heartbeat interval. Anything received
//! from the peer counts as a pingback; if nothing arrives within the ping
//! timeout the transport is closed.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};

use super::broker::RemoteRef;

/// Start pinging `remote` with `ping` every `interval`, disconnecting it
/// after `timeout` of silence
pub fn spawn_pinger<C>(remote: RemoteRef, ping: C, interval: Duration, timeout: Duration) -> JoinHandle<()>
where
    C: Serialize + Send + Sync + 'static,
{
    let ping = Arc::new(ping);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = remote.last_heard() + timeout;
            tokio::select! {
                _ = remote.closed() => break,

                _ = ticker.tick() => {
                    let remote = remote.clone();
                    let ping = Arc::clone(&ping);
                    tokio::spawn(async move {
                        match remote.call_remote::<_, Value>(ping.as_ref()).await {
                            Ok(_) => tracing::trace!(peer = %remote.peer(), "Pingback"),
                            Err(e) if e.is_disconnect() => {}
                            Err(e) => tracing::trace!(peer = %remote.peer(), error = %e, "Ping failed"),
                        }
                    });
                }

                _ = sleep_until(deadline) => {
                    let silent = Instant::now().saturating_duration_since(remote.last_heard());
                    if silent >= timeout {
                        tracing::info!(
                            peer = %remote.peer(),
                            silent_ms = silent.as_millis() as u64,
                            "Peer stopped responding, disconnecting"
                        );
                        remote.disconnect();
                        break;
                    }
                }
            }
        }
    })
}
