//! Authenticated bidirectional RPC
//!
//! Peers connect over TCP or TLS, log in with credentials and an interface
//! tag, and then exchange length-prefixed JSON frames with the manager.
//! Both sides may call the other; every logged-in peer is pinged each
//! heartbeat and dropped when it falls silent.

pub mod broker;
pub mod frame;
pub mod loopback;
pub mod message;
pub mod ping;
pub mod portal;
pub mod server;

pub use broker::{Perspective, RemoteRef};
pub use frame::{Frame, FrameCodec, FrameError};
pub use loopback::{IncomingCall, LoopbackPeer};
pub use message::{
    AdminCall, ClockInfo, ComponentCall, InterfaceTag, JobState, ManagerRequest, WorkerCall,
};
pub use ping::spawn_pinger;
pub use portal::{Portal, Realm};
pub use server::RpcServer;
