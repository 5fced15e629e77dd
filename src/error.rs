//! Error types
//!
//! `Error` is the crate-wide error. Module errors convert into it with `?`.
//! `RemoteError` is the serialisable form that crosses the wire: peers only
//! ever see an [`ErrorKind`] and a message, never a backtrace.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::manager::ports::PortError;
use crate::rpc::frame::FrameError;
use crate::state::{Mood, StateError};
use crate::streamer::http::HttpError;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared with peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    // authentication
    Unauthorized,
    // routing
    NoPerspective,
    NoBundle,
    UnknownComponent,
    AlreadyConnected,
    // mood
    ComponentMood,
    ComponentNoWorker,
    BusyComponent,
    SleepingComponent,
    ComponentAlreadyRunning,
    // remote execution
    RemoteRun,
    RemoteMethod,
    // configuration
    Config,
    NotImplemented,
    // transport
    ConnectionLost,
    ConnectError,
    ConnectionRefused,
    NotConnected,
    Protocol,
}

impl ErrorKind {
    /// Whether this kind means the peer could not open a media connection
    pub fn is_connect_failure(self) -> bool {
        matches!(self, ErrorKind::ConnectError | ErrorKind::ConnectionRefused)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&name)
    }
}

/// Error carried across the RPC boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Errors raised by mood-dependent component operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComponentError {
    #[error("component {id} cannot do this while {mood}")]
    Mood { id: String, mood: Mood },

    #[error("worker {worker} for component {id} is not logged in")]
    NoWorker { id: String, worker: String },

    #[error("component {id} is busy going {pending}")]
    Busy { id: String, pending: Mood },

    #[error("component {0} is sleeping")]
    Sleeping(String),

    #[error("component {0} is already running")]
    AlreadyRunning(String),
}

impl ComponentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ComponentError::Mood { .. } => ErrorKind::ComponentMood,
            ComponentError::NoWorker { .. } => ErrorKind::ComponentNoWorker,
            ComponentError::Busy { .. } => ErrorKind::BusyComponent,
            ComponentError::Sleeping(_) => ErrorKind::SleepingComponent,
            ComponentError::AlreadyRunning(_) => ErrorKind::ComponentAlreadyRunning,
        }
    }
}

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("no perspective for {0}")]
    NoPerspective(String),

    #[error("no bundle: {0}")]
    NoBundle(String),

    #[error("unknown component: {0}")]
    UnknownComponent(String),

    #[error("already connected: {0}")]
    AlreadyConnected(String),

    #[error(transparent)]
    Component(#[from] ComponentError),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection lost")]
    ConnectionLost,

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Ports(#[from] PortError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl Error {
    /// Classify this error for the wire
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::NoPerspective(_) => ErrorKind::NoPerspective,
            Error::NoBundle(_) => ErrorKind::NoBundle,
            Error::UnknownComponent(_) => ErrorKind::UnknownComponent,
            Error::AlreadyConnected(_) => ErrorKind::AlreadyConnected,
            Error::Component(e) => e.kind(),
            Error::NotImplemented(_) => ErrorKind::NotImplemented,
            Error::NotConnected => ErrorKind::NotConnected,
            Error::ConnectionLost => ErrorKind::ConnectionLost,
            Error::Remote(e) => e.kind,
            Error::Config(_) => ErrorKind::Config,
            Error::State(_) | Error::Ports(_) | Error::Serialization(_) => ErrorKind::RemoteRun,
            Error::Frame(_) | Error::Protocol(_) | Error::Http(_) => ErrorKind::Protocol,
            Error::Io(_) | Error::Tls(_) => ErrorKind::ConnectionLost,
        }
    }

    /// Whether this error means a transport is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NotConnected | ErrorKind::ConnectionLost
        )
    }

    /// Convert into the serialisable form sent to peers
    pub fn to_remote(&self) -> RemoteError {
        match self {
            Error::Remote(e) => e.clone(),
            other => RemoteError::new(other.kind(), other.to_string()),
        }
    }
}

impl From<tokio_rustls::rustls::Error> for Error {
    fn from(e: tokio_rustls::rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::ComponentNoWorker).unwrap();
        assert_eq!(json, "\"component-no-worker\"");
        assert_eq!(ErrorKind::AlreadyConnected.to_string(), "already-connected");
    }

    #[test]
    fn test_component_error_kinds() {
        let err: Error = ComponentError::Busy {
            id: "/f/c".into(),
            pending: Mood::Happy,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::BusyComponent);
        assert_eq!(err.to_remote().kind, ErrorKind::BusyComponent);
    }

    #[test]
    fn test_remote_error_roundtrips_kind() {
        let err = Error::Remote(RemoteError::new(ErrorKind::ConnectionRefused, "nope"));
        assert!(err.kind().is_connect_failure());
        assert_eq!(err.to_remote().message, "nope");
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(Error::NotConnected.is_disconnect());
        assert!(Error::ConnectionLost.is_disconnect());
        assert!(!Error::UnknownComponent("/a/b".into()).is_disconnect());
    }
}
