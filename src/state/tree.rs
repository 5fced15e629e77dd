//! Observable state tree
//!
//! Nodes live in an arena addressed by [`NodeId`]. Each node has a
//! [`NodeKind`] whose schema fixes its keys and their shape. Every mutation
//! notifies listeners synchronously, in registration order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::StateError;

/// Stable identifier of a node in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of a node, which fixes its key schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Planet,
    Flow,
    Component,
    WorkerHeaven,
}

/// Shape of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Plain value, changed with `set`
    Scalar,
    /// List of values, changed with `append`/`remove`
    List,
    /// String-keyed map, changed with `setitem`/`delitem`
    Dict,
    /// Reference to a single child node
    Child,
    /// List of child node references
    Children,
}

impl NodeKind {
    /// Declared keys for this kind of node
    pub fn schema(self) -> &'static [(&'static str, KeyKind)] {
        use KeyKind::*;
        match self {
            NodeKind::Planet => &[
                ("name", Scalar),
                ("version", Scalar),
                ("atmosphere", Child),
                ("flows", Children),
                ("messages", Dict),
                ("workers", Child),
            ],
            NodeKind::Flow => &[
                ("name", Scalar),
                ("parent", Scalar),
                ("components", Children),
            ],
            NodeKind::Component => &[
                ("name", Scalar),
                ("type", Scalar),
                ("parent", Scalar),
                ("workerRequested", Scalar),
                ("workerName", Scalar),
                ("pid", Scalar),
                ("mood", Scalar),
                ("moodPending", Scalar),
                ("config", Scalar),
                ("jobState", Scalar),
                ("messages", List),
            ],
            NodeKind::WorkerHeaven => &[("names", List), ("workers", Dict)],
        }
    }

    fn key_kind(self, key: &str) -> Option<KeyKind> {
        self.schema()
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, kind)| *kind)
    }
}

/// What a mutation did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum StateOp {
    Set { value: Value },
    Append { value: Value },
    Remove { value: Value },
    SetItem { item: String, value: Value },
    DelItem { item: String, value: Value },
}

/// A single change notification
///
/// For child keys the value carries the child's snapshot rather than its
/// bare id, so remote observers can build the subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub node: NodeId,
    pub kind: NodeKind,
    pub key: String,
    #[serde(flatten)]
    pub op: StateOp,
}

/// Identifier returned by [`StateTree::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// What a listener observes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerTarget {
    /// A single node
    Node(NodeId),
    /// Every node in the tree
    All,
}

type Callback = Box<dyn FnMut(&StateEvent) + Send>;

struct Listener {
    id: ListenerId,
    target: ListenerTarget,
    keys: Option<HashSet<String>>,
    callback: Callback,
}

impl Listener {
    fn wants(&self, event: &StateEvent) -> bool {
        let target_matches = match self.target {
            ListenerTarget::All => true,
            ListenerTarget::Node(id) => id == event.node,
        };
        target_matches
            && self
                .keys
                .as_ref()
                .map_or(true, |keys| keys.contains(&event.key))
    }
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    values: BTreeMap<&'static str, Value>,
}

/// Arena of observable nodes
#[derive(Default)]
pub struct StateTree {
    nodes: HashMap<NodeId, Node>,
    next_node: u64,
    listeners: Vec<Listener>,
    next_listener: u64,
}

impl fmt::Debug for StateTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateTree")
            .field("nodes", &self.nodes.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl StateTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node with every key at its empty value
    pub fn create(&mut self, kind: NodeKind) -> NodeId {
        self.next_node += 1;
        let id = NodeId(self.next_node);
        let values = kind
            .schema()
            .iter()
            .map(|(key, key_kind)| {
                let empty = match key_kind {
                    KeyKind::Scalar | KeyKind::Child => Value::Null,
                    KeyKind::List | KeyKind::Children => Value::Array(Vec::new()),
                    KeyKind::Dict => Value::Object(Map::new()),
                };
                (*key, empty)
            })
            .collect();
        self.nodes.insert(id, Node { kind, values });
        id
    }

    /// Remove a node and every node below it
    ///
    /// Listeners targeting removed nodes are dropped. No events are emitted;
    /// detach the node from its parent first so observers see that.
    pub fn destroy(&mut self, id: NodeId) {
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        for (key, value) in &node.values {
            match node.kind.key_kind(key) {
                Some(KeyKind::Child) => {
                    if let Some(child) = value.as_u64() {
                        self.destroy(NodeId(child));
                    }
                }
                Some(KeyKind::Children) => {
                    for child in value.as_array().into_iter().flatten() {
                        if let Some(child) = child.as_u64() {
                            self.destroy(NodeId(child));
                        }
                    }
                }
                _ => {}
            }
        }
        self.listeners
            .retain(|l| l.target != ListenerTarget::Node(id));
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn kind(&self, id: NodeId) -> Option<NodeKind> {
        self.nodes.get(&id).map(|n| n.kind)
    }

    /// Current value of a key
    pub fn get(&self, id: NodeId, key: &str) -> Result<&Value, StateError> {
        let node = self.nodes.get(&id).ok_or(StateError::NoSuchNode(id))?;
        node.values.get(key).ok_or_else(|| StateError::NoSuchKey {
            kind: node.kind,
            key: key.to_string(),
        })
    }

    /// Child node referenced by a `Child` key
    pub fn child(&self, id: NodeId, key: &str) -> Option<NodeId> {
        self.get(id, key).ok()?.as_u64().map(NodeId)
    }

    /// Child nodes referenced by a `Children` key
    pub fn children(&self, id: NodeId, key: &str) -> Vec<NodeId> {
        self.get(id, key)
            .ok()
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_u64).map(NodeId).collect())
            .unwrap_or_default()
    }

    fn slot(
        &mut self,
        id: NodeId,
        key: &str,
        allowed: &[KeyKind],
    ) -> Result<(NodeKind, KeyKind, &'static str, &mut Value), StateError> {
        let node = self.nodes.get_mut(&id).ok_or(StateError::NoSuchNode(id))?;
        let kind = node.kind;
        let (name, key_kind) = kind
            .schema()
            .iter()
            .find(|(name, _)| *name == key)
            .copied()
            .ok_or_else(|| StateError::NoSuchKey {
                kind,
                key: key.to_string(),
            })?;
        if !allowed.contains(&key_kind) {
            return Err(StateError::WrongKeyKind {
                key: key.to_string(),
                kind: key_kind,
            });
        }
        let value = node
            .values
            .get_mut(name)
            .ok_or_else(|| StateError::NoSuchKey {
                kind,
                key: key.to_string(),
            })?;
        Ok((kind, key_kind, name, value))
    }

    /// Set a scalar or child key
    pub fn set(&mut self, id: NodeId, key: &str, value: Value) -> Result<(), StateError> {
        let (kind, key_kind, name, slot) =
            self.slot(id, key, &[KeyKind::Scalar, KeyKind::Child])?;
        *slot = value.clone();
        let value = self.event_value(key_kind, value);
        self.emit(StateEvent {
            node: id,
            kind,
            key: name.to_string(),
            op: StateOp::Set { value },
        });
        Ok(())
    }

    /// Append to a list or children key
    pub fn append(&mut self, id: NodeId, key: &str, item: Value) -> Result<(), StateError> {
        let (kind, key_kind, name, slot) =
            self.slot(id, key, &[KeyKind::List, KeyKind::Children])?;
        if let Value::Array(items) = slot {
            items.push(item.clone());
        }
        let value = self.event_value(key_kind, item);
        self.emit(StateEvent {
            node: id,
            kind,
            key: name.to_string(),
            op: StateOp::Append { value },
        });
        Ok(())
    }

    /// Remove the first occurrence of `item` from a list or children key
    pub fn remove(&mut self, id: NodeId, key: &str, item: &Value) -> Result<(), StateError> {
        let (kind, key_kind, name, slot) =
            self.slot(id, key, &[KeyKind::List, KeyKind::Children])?;
        let removed = match slot {
            Value::Array(items) => items
                .iter()
                .position(|v| v == item)
                .map(|index| items.remove(index)),
            _ => None,
        };
        let Some(removed) = removed else {
            return Err(StateError::NoSuchItem {
                key: key.to_string(),
                item: item.to_string(),
            });
        };
        let value = self.event_value(key_kind, removed);
        self.emit(StateEvent {
            node: id,
            kind,
            key: name.to_string(),
            op: StateOp::Remove { value },
        });
        Ok(())
    }

    /// Insert or replace an entry of a dict key
    pub fn setitem(
        &mut self,
        id: NodeId,
        key: &str,
        item: &str,
        value: Value,
    ) -> Result<(), StateError> {
        let (kind, _, name, slot) = self.slot(id, key, &[KeyKind::Dict])?;
        if let Value::Object(map) = slot {
            map.insert(item.to_string(), value.clone());
        }
        self.emit(StateEvent {
            node: id,
            kind,
            key: name.to_string(),
            op: StateOp::SetItem {
                item: item.to_string(),
                value,
            },
        });
        Ok(())
    }

    /// Delete an entry of a dict key
    pub fn delitem(&mut self, id: NodeId, key: &str, item: &str) -> Result<(), StateError> {
        let (kind, _, name, slot) = self.slot(id, key, &[KeyKind::Dict])?;
        let removed = match slot {
            Value::Object(map) => map.remove(item),
            _ => None,
        };
        let Some(value) = removed else {
            return Err(StateError::NoSuchItem {
                key: key.to_string(),
                item: item.to_string(),
            });
        };
        self.emit(StateEvent {
            node: id,
            kind,
            key: name.to_string(),
            op: StateOp::DelItem {
                item: item.to_string(),
                value,
            },
        });
        Ok(())
    }

    /// Serialisable view of a node and its subtree
    pub fn snapshot(&self, id: NodeId) -> Option<Value> {
        let node = self.nodes.get(&id)?;
        let mut out = Map::new();
        out.insert("id".to_string(), Value::from(id.0));
        out.insert(
            "kind".to_string(),
            serde_json::to_value(node.kind).unwrap_or(Value::Null),
        );
        for (key, key_kind) in node.kind.schema() {
            let value = node.values.get(key).cloned().unwrap_or(Value::Null);
            out.insert((*key).to_string(), self.event_value(*key_kind, value));
        }
        Some(Value::Object(out))
    }

    fn event_value(&self, key_kind: KeyKind, value: Value) -> Value {
        match key_kind {
            KeyKind::Child => match value.as_u64() {
                Some(child) => self.snapshot(NodeId(child)).unwrap_or(value),
                None => value,
            },
            KeyKind::Children => match value {
                Value::Array(items) => Value::Array(
                    items
                        .into_iter()
                        .map(|item| self.event_value(KeyKind::Child, item))
                        .collect(),
                ),
                single => self.event_value(KeyKind::Child, single),
            },
            _ => value,
        }
    }

    /// Register a listener; `keys` restricts it to the named keys
    pub fn add_listener<F>(
        &mut self,
        target: ListenerTarget,
        keys: Option<&[&str]>,
        callback: F,
    ) -> ListenerId
    where
        F: FnMut(&StateEvent) + Send + 'static,
    {
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.listeners.push(Listener {
            id,
            target,
            keys: keys.map(|keys| keys.iter().map(|k| k.to_string()).collect()),
            callback: Box::new(callback),
        });
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.id != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn emit(&mut self, event: StateEvent) {
        for listener in self.listeners.iter_mut() {
            if !listener.wants(&event) {
                continue;
            }
            let callback = &mut listener.callback;
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                tracing::warn!(
                    node = %event.node,
                    key = %event.key,
                    "State listener panicked"
                );
            }
        }
    }
}
