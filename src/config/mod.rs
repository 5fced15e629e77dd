//! Configuration
//!
//! Manager runtime options, planet configuration documents and the helpers
//! that upgrade and persist them.

pub mod constants;
pub mod diff;
pub mod document;
pub mod manager;
pub mod persist;
pub mod upgrade;

use std::path::PathBuf;

pub use constants::*;
pub use diff::{ConfigDelta, DeltaKind};
pub use document::{
    ComponentConfig, ComponentEntry, EaterEntry, FlowEntry, ManagerSection, PlanetDocument,
};
pub use manager::{FeedMode, ManagerConfig, Transport};

/// Errors from loading, upgrading or saving configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "document".to_string()))]
    Parse {
        path: Option<PathBuf>,
        message: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("cannot upgrade config from version {version}: {message}")]
    Upgrade { version: u32, message: String },
}
