//! Planet state
//!
//! The manager's view of the world: a listener-notified tree of the planet,
//! its flows, components and workers.

pub mod planet;
pub mod tree;

pub use planet::{ComponentSnapshot, Message, MessageLevel, Mood, Planet, WorkerInfo};
pub use tree::{
    KeyKind, ListenerId, ListenerTarget, NodeId, NodeKind, StateEvent, StateOp, StateTree,
};

/// Errors from state tree operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("no such node {0}")]
    NoSuchNode(NodeId),

    #[error("{kind:?} has no key {key}")]
    NoSuchKey { kind: NodeKind, key: String },

    #[error("key {key} is a {kind:?} key")]
    WrongKeyKind { key: String, kind: KeyKind },

    #[error("{key} has no item {item}")]
    NoSuchItem { key: String, item: String },
}
