//! Planet facade over the state tree

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::tree::{NodeId, NodeKind, StateTree};
use super::StateError;
use crate::config::constants::{ATMOSPHERE, VERSION};
use crate::config::document::{avatar_id, parse_avatar_id, ComponentConfig};

/// Component mood
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Happy,
    Hungry,
    Waking,
    Sleeping,
    Lost,
    Sad,
}

impl Mood {
    pub fn as_str(self) -> &'static str {
        match self {
            Mood::Happy => "happy",
            Mood::Hungry => "hungry",
            Mood::Waking => "waking",
            Mood::Sleeping => "sleeping",
            Mood::Lost => "lost",
            Mood::Sad => "sad",
        }
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a planet or component message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

/// A message shown to administrators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub level: MessageLevel,
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(level: MessageLevel, id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            level,
            id: id.into(),
            text: text.into(),
            debug: None,
            timestamp: Utc::now(),
        }
    }

    pub fn info(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(MessageLevel::Info, id, text)
    }

    pub fn warning(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(MessageLevel::Warning, id, text)
    }

    pub fn error(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(MessageLevel::Error, id, text)
    }

    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = Some(debug.into());
        self
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A logged-in worker as recorded in the planet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub name: String,
    pub host: String,
    pub feed_server_port: Option<u16>,
}

/// Plain view of a component node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSnapshot {
    pub avatar_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub parent: String,
    pub worker_requested: Option<String>,
    pub worker_name: Option<String>,
    pub pid: Option<u32>,
    pub mood: Mood,
    pub mood_pending: Option<Mood>,
    pub messages: Vec<Message>,
}

/// The planet: atmosphere, flows, planet messages and the worker heaven
#[derive(Debug)]
pub struct Planet {
    tree: StateTree,
    root: NodeId,
    atmosphere: NodeId,
    workers: NodeId,
}

impl Planet {
    pub fn new(name: &str) -> Self {
        let mut tree = StateTree::new();
        let root = tree.create(NodeKind::Planet);
        let atmosphere = tree.create(NodeKind::Flow);
        let workers = tree.create(NodeKind::WorkerHeaven);

        // Freshly created nodes have every declared key
        let _ = tree.set(atmosphere, "name", json!(ATMOSPHERE));
        let _ = tree.set(root, "name", json!(name));
        let _ = tree.set(root, "version", json!(VERSION));
        let _ = tree.set(root, "atmosphere", json!(atmosphere.0));
        let _ = tree.set(root, "workers", json!(workers.0));

        Self {
            tree,
            root,
            atmosphere,
            workers,
        }
    }

    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut StateTree {
        &mut self.tree
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn atmosphere(&self) -> NodeId {
        self.atmosphere
    }

    pub fn worker_heaven(&self) -> NodeId {
        self.workers
    }

    fn str_of(&self, node: NodeId, key: &str) -> Option<String> {
        self.tree
            .get(node, key)
            .ok()
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    pub fn name(&self) -> String {
        self.str_of(self.root, "name").unwrap_or_default()
    }

    /// Whole planet as a serialisable value
    pub fn snapshot(&self) -> Value {
        self.tree.snapshot(self.root).unwrap_or(Value::Null)
    }

    // ---- flows

    pub fn flows(&self) -> Vec<NodeId> {
        self.tree.children(self.root, "flows")
    }

    pub fn flow_name(&self, flow: NodeId) -> Option<String> {
        self.str_of(flow, "name")
    }

    pub fn find_flow(&self, name: &str) -> Option<NodeId> {
        self.flows()
            .into_iter()
            .find(|f| self.flow_name(*f).as_deref() == Some(name))
    }

    /// Find or create the flow called `name`
    pub fn ensure_flow(&mut self, name: &str) -> Result<NodeId, StateError> {
        if let Some(flow) = self.find_flow(name) {
            return Ok(flow);
        }
        let flow = self.tree.create(NodeKind::Flow);
        self.tree.set(flow, "name", json!(name))?;
        self.tree.set(flow, "parent", json!(self.name()))?;
        self.tree.append(self.root, "flows", json!(flow.0))?;
        tracing::debug!(flow = name, "Created flow");
        Ok(flow)
    }

    /// Detach and destroy a flow with all its components
    pub fn remove_flow(&mut self, flow: NodeId) -> Result<(), StateError> {
        self.tree.remove(self.root, "flows", &json!(flow.0))?;
        self.tree.destroy(flow);
        Ok(())
    }

    /// Node holding the components of `parent` (atmosphere or a flow)
    pub fn parent_node(&self, parent: &str) -> Option<NodeId> {
        if parent == ATMOSPHERE {
            Some(self.atmosphere)
        } else {
            self.find_flow(parent)
        }
    }

    // ---- components

    pub fn components_of(&self, parent: NodeId) -> Vec<NodeId> {
        self.tree.children(parent, "components")
    }

    /// Every component, atmosphere first then flows in creation order
    pub fn all_components(&self) -> Vec<NodeId> {
        std::iter::once(self.atmosphere)
            .chain(self.flows())
            .flat_map(|parent| self.components_of(parent))
            .collect()
    }

    pub fn find_component(&self, id: &str) -> Option<NodeId> {
        let (parent, name) = parse_avatar_id(id)?;
        let parent = self.parent_node(parent)?;
        self.components_of(parent)
            .into_iter()
            .find(|c| self.str_of(*c, "name").as_deref() == Some(name))
    }

    pub fn avatar_id(&self, component: NodeId) -> Option<String> {
        let parent = self.str_of(component, "parent")?;
        let name = self.str_of(component, "name")?;
        Some(avatar_id(&parent, &name))
    }

    /// Create a sleeping component for `config`, creating its flow if needed
    pub fn add_component(&mut self, config: &ComponentConfig) -> Result<NodeId, StateError> {
        let parent = if config.parent == ATMOSPHERE {
            self.atmosphere
        } else {
            self.ensure_flow(&config.parent)?
        };
        let node = self.tree.create(NodeKind::Component);
        self.tree.set(node, "name", json!(config.name))?;
        self.tree.set(node, "type", json!(config.kind))?;
        self.tree.set(node, "parent", json!(config.parent))?;
        self.tree
            .set(node, "workerRequested", json!(config.worker))?;
        self.tree.set(node, "mood", json!(Mood::Sleeping))?;
        self.tree.set(node, "config", config.to_value())?;
        self.tree.append(parent, "components", json!(node.0))?;
        Ok(node)
    }

    /// Detach and destroy a component
    pub fn remove_component(&mut self, component: NodeId) -> Result<(), StateError> {
        let parent = self
            .str_of(component, "parent")
            .and_then(|p| self.parent_node(&p))
            .ok_or(StateError::NoSuchNode(component))?;
        self.tree
            .remove(parent, "components", &json!(component.0))?;
        self.tree.destroy(component);
        Ok(())
    }

    pub fn mood(&self, component: NodeId) -> Option<Mood> {
        let value = self.tree.get(component, "mood").ok()?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn set_mood(&mut self, component: NodeId, mood: Mood) -> Result<(), StateError> {
        self.tree.set(component, "mood", json!(mood))
    }

    pub fn mood_pending(&self, component: NodeId) -> Option<Mood> {
        let value = self.tree.get(component, "moodPending").ok()?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn set_mood_pending(
        &mut self,
        component: NodeId,
        mood: Option<Mood>,
    ) -> Result<(), StateError> {
        self.tree.set(component, "moodPending", json!(mood))
    }

    pub fn worker_requested(&self, component: NodeId) -> Option<String> {
        self.str_of(component, "workerRequested")
    }

    pub fn worker_name(&self, component: NodeId) -> Option<String> {
        self.str_of(component, "workerName")
    }

    pub fn set_worker_name(
        &mut self,
        component: NodeId,
        worker: Option<&str>,
    ) -> Result<(), StateError> {
        self.tree.set(component, "workerName", json!(worker))
    }

    pub fn set_pid(&mut self, component: NodeId, pid: Option<u32>) -> Result<(), StateError> {
        self.tree.set(component, "pid", json!(pid))
    }

    pub fn component_config(&self, component: NodeId) -> Option<ComponentConfig> {
        let value = self.tree.get(component, "config").ok()?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn component_config_value(&self, component: NodeId) -> Value {
        self.tree
            .get(component, "config")
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn set_component_config(
        &mut self,
        component: NodeId,
        config: &ComponentConfig,
    ) -> Result<(), StateError> {
        self.tree.set(component, "type", json!(config.kind))?;
        self.tree
            .set(component, "workerRequested", json!(config.worker))?;
        self.tree.set(component, "config", config.to_value())
    }

    pub fn set_job_state(&mut self, component: NodeId, job: Value) -> Result<(), StateError> {
        self.tree.set(component, "jobState", job)
    }

    pub fn job_state(&self, component: NodeId) -> Value {
        self.tree
            .get(component, "jobState")
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn component_messages(&self, component: NodeId) -> Vec<Message> {
        self.tree
            .get(component, "messages")
            .ok()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Attach a message, replacing one with the same id
    pub fn add_component_message(
        &mut self,
        component: NodeId,
        message: Message,
    ) -> Result<(), StateError> {
        self.remove_component_message(component, &message.id)?;
        self.tree
            .append(component, "messages", message.to_value())
    }

    /// Remove the message with `id`; returns whether there was one
    pub fn remove_component_message(
        &mut self,
        component: NodeId,
        id: &str,
    ) -> Result<bool, StateError> {
        let existing = self
            .tree
            .get(component, "messages")?
            .as_array()
            .and_then(|items| items.iter().find(|m| m["id"] == json!(id)).cloned());
        match existing {
            Some(value) => {
                self.tree.remove(component, "messages", &value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn component_snapshot(&self, component: NodeId) -> Option<ComponentSnapshot> {
        Some(ComponentSnapshot {
            avatar_id: self.avatar_id(component)?,
            name: self.str_of(component, "name")?,
            kind: self.str_of(component, "type").unwrap_or_default(),
            parent: self.str_of(component, "parent")?,
            worker_requested: self.worker_requested(component),
            worker_name: self.worker_name(component),
            pid: self
                .tree
                .get(component, "pid")
                .ok()
                .and_then(Value::as_u64)
                .and_then(|p| u32::try_from(p).ok()),
            mood: self.mood(component)?,
            mood_pending: self.mood_pending(component),
            messages: self.component_messages(component),
        })
    }

    // ---- planet messages

    /// Add or replace a planet message
    pub fn add_message(&mut self, message: Message) -> Result<(), StateError> {
        let id = message.id.clone();
        self.tree
            .setitem(self.root, "messages", &id, message.to_value())
    }

    pub fn remove_message(&mut self, id: &str) -> Result<(), StateError> {
        self.tree.delitem(self.root, "messages", id)
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        let messages = self.tree.get(self.root, "messages").ok()?;
        serde_json::from_value(messages.get(id)?.clone()).ok()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.tree
            .get(self.root, "messages")
            .ok()
            .and_then(Value::as_object)
            .map(|map| {
                map.values()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    // ---- workers

    pub fn add_worker(&mut self, worker: &WorkerInfo) -> Result<(), StateError> {
        let value = serde_json::to_value(worker).unwrap_or(Value::Null);
        self.tree
            .append(self.workers, "names", json!(worker.name))?;
        self.tree
            .setitem(self.workers, "workers", &worker.name, value)
    }

    pub fn remove_worker(&mut self, name: &str) -> Result<(), StateError> {
        self.tree.delitem(self.workers, "workers", name)?;
        self.tree.remove(self.workers, "names", &json!(name))
    }

    pub fn worker(&self, name: &str) -> Option<WorkerInfo> {
        let workers = self.tree.get(self.workers, "workers").ok()?;
        serde_json::from_value(workers.get(name)?.clone()).ok()
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.tree
            .get(self.workers, "names")
            .ok()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tree::{ListenerTarget, StateOp};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_new_planet_layout() {
        let planet = Planet::new("lab");

        assert_eq!(planet.name(), "lab");
        assert_eq!(planet.parent_node(ATMOSPHERE), Some(planet.atmosphere()));
        assert!(planet.flows().is_empty());
        let snapshot = planet.snapshot();
        assert_eq!(snapshot["atmosphere"]["name"], json!(ATMOSPHERE));
        assert_eq!(snapshot["version"], json!(VERSION));
    }

    #[test]
    fn test_add_component_creates_flow() {
        let mut planet = Planet::new("lab");
        let mut config = ComponentConfig::new("f", "prod", "videotest-producer");
        config.worker = Some("w1".into());

        let node = planet.add_component(&config).unwrap();

        let flow = planet.find_flow("f").unwrap();
        assert_eq!(planet.components_of(flow), vec![node]);
        assert_eq!(planet.find_component("/f/prod"), Some(node));
        assert_eq!(planet.mood(node), Some(Mood::Sleeping));
        assert_eq!(planet.worker_requested(node).as_deref(), Some("w1"));
        assert_eq!(planet.component_config(node), Some(config));
    }

    #[test]
    fn test_mood_pending_roundtrip() {
        let mut planet = Planet::new("lab");
        let node = planet
            .add_component(&ComponentConfig::new(ATMOSPHERE, "porter", "porter"))
            .unwrap();

        assert_eq!(planet.mood_pending(node), None);
        planet.set_mood_pending(node, Some(Mood::Happy)).unwrap();
        assert_eq!(planet.mood_pending(node), Some(Mood::Happy));
        planet.set_mood_pending(node, None).unwrap();
        assert_eq!(planet.mood_pending(node), None);
    }

    #[test]
    fn test_component_messages_replace_by_id() {
        let mut planet = Planet::new("lab");
        let node = planet
            .add_component(&ComponentConfig::new("f", "c", "t"))
            .unwrap();

        planet
            .add_component_message(node, Message::error("eat-failed", "first"))
            .unwrap();
        planet
            .add_component_message(node, Message::error("eat-failed", "second"))
            .unwrap();

        let messages = planet.component_messages(node);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "second");
        assert!(planet.remove_component_message(node, "eat-failed").unwrap());
        assert!(!planet.remove_component_message(node, "eat-failed").unwrap());
    }

    #[test]
    fn test_planet_messages_notify() {
        let mut planet = Planet::new("lab");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let root = planet.root();
        planet.tree_mut().add_listener(
            ListenerTarget::Node(root),
            Some(&["messages"]),
            move |e| sink.lock().unwrap().push(e.op.clone()),
        );

        planet
            .add_message(Message::warning("loadComponent-/f1/c1", "conflict"))
            .unwrap();

        assert_eq!(planet.messages().len(), 1);
        assert_eq!(
            planet.message("loadComponent-/f1/c1").map(|m| m.level),
            Some(MessageLevel::Warning)
        );
        assert!(matches!(
            seen.lock().unwrap()[0],
            StateOp::SetItem { ref item, .. } if item == "loadComponent-/f1/c1"
        ));
    }

    #[test]
    fn test_worker_heaven() {
        let mut planet = Planet::new("lab");
        let worker = WorkerInfo {
            name: "w1".into(),
            host: "10.0.0.1".into(),
            feed_server_port: Some(8600),
        };

        planet.add_worker(&worker).unwrap();
        assert_eq!(planet.worker("w1"), Some(worker));
        assert_eq!(planet.worker_names(), vec!["w1".to_string()]);

        planet.remove_worker("w1").unwrap();
        assert_eq!(planet.worker("w1"), None);
        assert!(planet.worker_names().is_empty());
    }

    #[test]
    fn test_remove_flow_destroys_components() {
        let mut planet = Planet::new("lab");
        let node = planet
            .add_component(&ComponentConfig::new("f", "c", "t"))
            .unwrap();
        let flow = planet.find_flow("f").unwrap();

        planet.remove_flow(flow).unwrap();
        assert!(planet.find_flow("f").is_none());
        assert!(!planet.tree().contains(node));
    }
}
