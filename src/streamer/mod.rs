//! HTTP streaming component
//!
//! Serves one media stream to many audience clients over plain HTTP. The
//! pipeline feeds buffers into the [`Sink`]; the [`Streamer`] admits
//! connections, checks them with a bouncer and tracks who is watching.
//!
//! ```text
//!   TCP accept ─► read request ─► /admin? ─► mounted? ─► ready? ─► budget? ─► bouncer
//!                                                                               │
//!                          access log ◄── client removed ◄── Sink ◄── head ◄───┘
//! ```

pub mod access;
pub mod admin;
pub mod config;
pub mod http;
pub mod mime;
pub mod resource;
pub mod server;
pub mod sink;
pub mod stats;

pub use config::{IssuerKind, StreamerConfig};
pub use http::{HttpError, Request, Response};
pub use server::Streamer;
pub use sink::{ClientRemoved, RemoveReason, Sink};
pub use stats::{LoadData, StreamStats};
