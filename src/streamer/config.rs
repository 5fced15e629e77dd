//! Streamer configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::constants::{DEFAULT_STREAM_PORT, RESERVED_FDS};
use crate::config::manager::duration_secs;
use crate::config::ConfigError;

/// What the streamer builds keycards from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssuerKind {
    /// HTTP Basic credentials
    #[default]
    HttpAuth,
    /// A `token` query parameter
    HttpToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StreamerConfig {
    /// Avatar id of the streamer component; stamped on keycards
    pub name: String,

    pub bind_addr: SocketAddr,

    /// Path the stream is served under
    pub mount_point: String,

    /// Host name used in the stream URL
    pub hostname: String,

    /// Upper bound on audience connections; the descriptor budget always applies
    pub max_clients: Option<usize>,

    /// File descriptors kept back from the audience
    pub reserved_fds: u64,

    /// Bouncer that judges audience keycards; none admits everybody
    pub bouncer: Option<String>,

    pub issuer: IssuerKind,

    /// Realm for HTTP auth challenges, also stamped on keycards
    pub domain: Option<String>,

    pub admin_user: String,

    /// Password for `/admin`; without one only localhost gets in
    pub admin_password: Option<String>,

    pub access_log: Option<PathBuf>,

    /// Buffers a client may fall behind before it is dropped
    pub client_backlog: usize,

    /// Time a client gets to send its request
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Window for load deltas and the current bitrate
    #[serde(with = "duration_secs")]
    pub stats_interval: Duration,

    pub tcp_nodelay: bool,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            name: "/default/http".to_string(),
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_STREAM_PORT),
            mount_point: "/".to_string(),
            hostname: "localhost".to_string(),
            max_clients: None,
            reserved_fds: RESERVED_FDS,
            bouncer: None,
            issuer: IssuerKind::HttpAuth,
            domain: None,
            admin_user: "admin".to_string(),
            admin_password: None,
            access_log: None,
            client_backlog: 256,
            request_timeout: Duration::from_secs(10),
            stats_interval: Duration::from_secs(10),
            tcp_nodelay: true,
        }
    }
}

impl StreamerConfig {
    /// Create a config for the streamer component `name`
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
        let config: Self = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            message: e.to_string(),
        })?;
        let mount = config.mount_point.clone();
        Ok(config.mount(mount))
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Serve the stream under `path`; a leading slash is added if missing
    pub fn mount(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.mount_point = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        self
    }

    /// Set maximum clients
    pub fn max_clients(mut self, max: usize) -> Self {
        self.max_clients = Some(max);
        self
    }

    /// Authenticate clients with the named bouncer
    pub fn bouncer(mut self, name: impl Into<String>) -> Self {
        self.bouncer = Some(name.into());
        self
    }

    pub fn issuer(mut self, issuer: IssuerKind) -> Self {
        self.issuer = issuer;
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn admin_password(mut self, password: impl Into<String>) -> Self {
        self.admin_password = Some(password.into());
        self
    }

    pub fn access_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.access_log = Some(path.into());
        self
    }

    /// Whether `path` falls under the mount point
    pub fn is_mounted(&self, path: &str) -> bool {
        let mount = self.mount_point.trim_end_matches('/');
        mount.is_empty() || path == mount || path.starts_with(&format!("{}/", mount))
    }

    /// URL audiences use to reach the stream
    pub fn url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.hostname,
            self.bind_addr.port(),
            self.mount_point
        )
    }
}
