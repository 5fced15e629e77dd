//! Manager configuration

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::constants::*;
use super::ConfigError;

/// How the manager's RPC listener is exposed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Transport {
    /// Plaintext TCP
    Tcp,
    /// TLS with a single PEM file holding the certificate chain and key
    Ssl { certificate: PathBuf },
}

/// Which side initiates feed connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
    /// Eaters connect upstream to feeders (`eatFrom`)
    #[default]
    Pull,
    /// Feeders push downstream to eaters (`feedTo`)
    Push,
}

/// Manager configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ManagerConfig {
    /// Manager (planet) name
    pub name: String,

    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Plaintext or TLS
    pub transport: Transport,

    /// Maximum concurrent peer connections (0 = unlimited)
    pub max_connections: usize,

    /// Interval between liveness pings
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Missed-ping window as a multiple of the heartbeat interval
    pub ping_timeout_multiplier: f64,

    /// Time a connection gets to log in
    #[serde(with = "duration_secs")]
    pub login_timeout: Duration,

    /// Enable TCP_NODELAY on peer sockets
    pub tcp_nodelay: bool,

    /// Feed connection direction
    pub feed_mode: FeedMode,

    /// Accepted peer credentials; empty allows anonymous login
    pub users: BTreeMap<String, String>,

    /// Base directory for saved planet configuration
    pub config_dir: PathBuf,

    /// Directory for pid files
    pub run_dir: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "planet".to_string(),
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_TCP_PORT),
            transport: Transport::Tcp,
            max_connections: 0,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            ping_timeout_multiplier: PING_TIMEOUT_MULTIPLIER,
            login_timeout: LOGIN_TIMEOUT,
            tcp_nodelay: true,
            feed_mode: FeedMode::Pull,
            users: BTreeMap::new(),
            config_dir: PathBuf::from("/etc/mediaplanet"),
            run_dir: PathBuf::from("/var/run/mediaplanet"),
        }
    }
}

impl ManagerConfig {
    /// Create a config with the given manager name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load a TOML config file; missing keys take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            message: e.to_string(),
        })
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Serve over TLS using the given PEM file, moving to the TLS port
    /// unless a non-default port was already chosen
    pub fn ssl(mut self, certificate: impl Into<PathBuf>) -> Self {
        if self.bind_addr.port() == DEFAULT_TCP_PORT {
            self.bind_addr.set_port(DEFAULT_TLS_PORT);
        }
        self.transport = Transport::Ssl {
            certificate: certificate.into(),
        };
        self
    }

    /// Set the heartbeat interval
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the login timeout
    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the feed connection direction
    pub fn feed_mode(mut self, mode: FeedMode) -> Self {
        self.feed_mode = mode;
        self
    }

    /// Accept the given username/password pair
    pub fn user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }

    /// Set the configuration and run directories
    pub fn dirs(mut self, config_dir: impl Into<PathBuf>, run_dir: impl Into<PathBuf>) -> Self {
        self.config_dir = config_dir.into();
        self.run_dir = run_dir.into();
        self
    }

    /// Silence window after which a peer is considered gone
    pub fn ping_timeout(&self) -> Duration {
        self.heartbeat_interval
            .mul_f64(self.ping_timeout_multiplier)
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
