//! Audience statistics

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Running client accounting for one stream
#[derive(Debug, Clone)]
pub struct Stats {
    started: Instant,
    started_at: DateTime<Utc>,
    clients: usize,
    added: u64,
    removed: u64,
    peak: usize,
    peak_time: DateTime<Utc>,
    average: f64,
    average_time: Instant,
    load_deltas: (f64, f64),
    deltas_window: (Instant, u64, u64),
    current_bitrate: Option<f64>,
    last_bytes_received: Option<u64>,
}

/// Snapshot served on the admin page
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub mime: Option<String>,
    pub uptime: Duration,
    /// Average stream bitrate since start, bits per second
    pub bitrate: f64,
    pub total_bytes: u64,
    pub current_clients: usize,
    pub max_clients: usize,
    pub average_clients: f64,
    pub peak_clients: usize,
    pub peak_time: DateTime<Utc>,
    /// Average bitrate sent to all clients together, bits per second
    pub consumption_bitrate: f64,
    pub consumption_bytes: u64,
}

/// Load estimate reported to the manager
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadData {
    /// Bitrate added per second by new clients
    pub delta_added: f64,
    /// Bitrate removed per second by departing clients
    pub delta_removed: f64,
    pub bytes_sent: u64,
    pub clients: usize,
    pub current_load: f64,
}

impl Stats {
    pub fn new(now: Instant) -> Self {
        let wall = Utc::now();
        Self {
            started: now,
            started_at: wall,
            clients: 0,
            added: 0,
            removed: 0,
            peak: 0,
            peak_time: wall,
            average: 0.0,
            average_time: now,
            load_deltas: (0.0, 0.0),
            deltas_window: (now, 0, 0),
            current_bitrate: None,
            last_bytes_received: None,
        }
    }

    /// Fold the time since the last change into the client average
    pub fn update_average(&mut self, now: Instant) {
        let before = self.average_time.duration_since(self.started).as_secs_f64();
        let since = now.duration_since(self.average_time).as_secs_f64();
        self.average_time = now;
        if before == 0.0 {
            self.average = 0.0;
            return;
        }
        let total = before + since;
        self.average = (self.average * before + self.clients as f64 * since) / total;
    }

    pub fn client_added(&mut self, now: Instant) {
        self.update_average(now);
        self.clients += 1;
        self.added += 1;
        // >= so the peak time is the last time it was reached
        if self.clients >= self.peak {
            self.peak = self.clients;
            self.peak_time = self.started_at
                + chrono::Duration::from_std(now.duration_since(self.started))
                    .unwrap_or_else(|_| chrono::Duration::zero());
        }
    }

    pub fn client_removed(&mut self, now: Instant) {
        self.update_average(now);
        self.clients = self.clients.saturating_sub(1);
        self.removed += 1;
    }

    /// Periodic tick: recompute load deltas and the current bitrate
    pub fn tick(&mut self, now: Instant, bytes_received: u64) {
        let (then, added, removed) = self.deltas_window;
        let elapsed = now.duration_since(then).as_secs_f64();
        if elapsed > 0.0 {
            self.load_deltas = (
                (self.added - added) as f64 / elapsed,
                (self.removed - removed) as f64 / elapsed,
            );
            if let Some(last) = self.last_bytes_received {
                self.current_bitrate =
                    Some(bytes_received.saturating_sub(last) as f64 * 8.0 / elapsed);
            }
        }
        self.deltas_window = (now, self.added, self.removed);
        self.last_bytes_received = Some(bytes_received);
    }

    pub fn clients(&self) -> usize {
        self.clients
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn average(&self) -> f64 {
        self.average
    }

    /// Clients added and removed per second over the last window
    pub fn load_deltas(&self) -> (f64, f64) {
        self.load_deltas
    }

    pub fn uptime(&self, now: Instant) -> Duration {
        now.duration_since(self.started)
    }

    /// Bitrate over the last window, or since start before the first one
    pub fn current_bitrate(&self, now: Instant, bytes_received: u64) -> f64 {
        self.current_bitrate
            .unwrap_or_else(|| average_bitrate(bytes_received, self.uptime(now)))
    }

    pub fn snapshot(
        &mut self,
        now: Instant,
        mime: Option<String>,
        bytes_received: u64,
        bytes_sent: u64,
        max_clients: usize,
    ) -> StreamStats {
        self.update_average(now);
        let uptime = self.uptime(now);
        StreamStats {
            mime,
            uptime,
            bitrate: average_bitrate(bytes_received, uptime),
            total_bytes: bytes_received,
            current_clients: self.clients,
            max_clients,
            average_clients: self.average,
            peak_clients: self.peak,
            peak_time: self.peak_time,
            consumption_bitrate: average_bitrate(bytes_sent, uptime),
            consumption_bytes: bytes_sent,
        }
    }

    pub fn load_data(&self, now: Instant, bytes_received: u64, bytes_sent: u64) -> LoadData {
        let bitrate = average_bitrate(bytes_received, self.uptime(now));
        let (added, removed) = self.load_deltas;
        LoadData {
            delta_added: added * bitrate,
            delta_removed: removed * bitrate,
            bytes_sent,
            clients: self.clients,
            current_load: bitrate * self.clients as f64,
        }
    }
}

fn average_bitrate(bytes: u64, over: Duration) -> f64 {
    let secs = over.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 * 8.0 / secs
    } else {
        0.0
    }
}
