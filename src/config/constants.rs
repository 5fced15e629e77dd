//! Well-known ports, intervals and names

use std::ops::RangeInclusive;
use std::time::Duration;

/// Default plaintext TCP port for the manager
pub const DEFAULT_TCP_PORT: u16 = 8642;

/// Default TLS port for the manager
pub const DEFAULT_TLS_PORT: u16 = 7531;

/// Ports handed to workers for feed servers
pub const FEED_SERVER_PORTS: RangeInclusive<u16> = 8600..=8639;

/// Ports used for public streams
pub const STREAM_PORTS: RangeInclusive<u16> = 8800..=8844;

/// Interval between liveness pings
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Missed-ping window, as a multiple of the heartbeat interval
pub const PING_TIMEOUT_MULTIPLIER: f64 = 2.5;

/// Time a fresh connection gets to send its login frame
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum encoded size of a single RPC frame
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Parent name of components that do not belong to a flow
pub const ATMOSPHERE: &str = "atmosphere";

/// Feed name used when a feed reference omits one
pub const DEFAULT_FEED: &str = "default";

/// Project name stamped on configs that do not name one
pub const DEFAULT_PROJECT: &str = "mediaplanet";

/// Current version of component configuration entries
pub const CONFIG_VERSION: u32 = 1;

/// File descriptors kept back from audience connections
pub const RESERVED_FDS: u64 = 50;

/// Default port for the HTTP streaming sink
pub const DEFAULT_STREAM_PORT: u16 = 8800;

/// Host used for feeds between components sharing a machine
pub const LOCALHOST: &str = "127.0.0.1";

/// Crate version, reported in the planet and the HTTP `Server` header
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
