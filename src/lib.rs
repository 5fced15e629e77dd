//! Manager core for a distributed streaming media server
//!
//! A manager holds the *planet*: the flows and components of a streaming
//! deployment, the workers they run on and the messages they raise. Workers,
//! components and admin clients log in over an authenticated RPC transport;
//! the manager starts components on workers, wires their feeds together,
//! distributes master clocks and keeps every admin in sync with the planet.
//!
//! The [`streamer`] module is the audience-facing end: an HTTP server that
//! fans one stream out to many clients, with bouncer authentication and
//! admission control.
//!
//! # Example
//!
//! ```no_run
//! use mediaplanet::config::ManagerConfig;
//! use mediaplanet::manager::Manager;
//!
//! #[tokio::main]
//! async fn main() -> mediaplanet::Result<()> {
//!     let manager = Manager::new(ManagerConfig::named("planet"));
//!     manager.load_configuration_str(
//!         "[[flow]]\nname = \"default\"\n\n[[flow.component]]\nname = \"producer\"\ntype = \"videotest-producer\"\nworker = \"localhost\"\n",
//!     )?;
//!     manager.server()?.run().await
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod manager;
pub mod rpc;
pub mod state;
pub mod streamer;

pub use config::{ManagerConfig, PlanetDocument};
pub use error::{Error, ErrorKind, RemoteError, Result};
pub use manager::Manager;
pub use streamer::{Streamer, StreamerConfig};
