//! Planet configuration documents
//!
//! A document describes the components a planet should run:
//!
//! ```toml
//! name = "studio"
//!
//! [manager]
//! bouncer = "htpasswd"
//!
//! [[atmosphere]]
//! name = "porter"
//! type = "porter"
//! worker = "w1"
//!
//! [[flow]]
//! name = "f"
//!
//! [[flow.component]]
//! name = "prod"
//! type = "videotest-producer"
//! worker = "w1"
//! feed = ["default"]
//!
//! [[flow.component]]
//! name = "enc"
//! type = "theora-encoder"
//! worker = "w2"
//! eater.default = [{ feed = "prod:default", alias = "default-prime" }]
//! ```
//!
//! Entries are upgraded to the current `config-version` before they are
//! deserialized.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::constants::{ATMOSPHERE, CONFIG_VERSION, DEFAULT_PROJECT, VERSION};
use super::upgrade;
use super::ConfigError;

/// Build a component avatar id from its parent and name
pub fn avatar_id(parent: &str, name: &str) -> String {
    format!("/{}/{}", parent, name)
}

/// Split a component avatar id into `(parent, name)`
pub fn parse_avatar_id(id: &str) -> Option<(&str, &str)> {
    let rest = id.strip_prefix('/')?;
    let (parent, name) = rest.split_once('/')?;
    if parent.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((parent, name))
}

/// A parsed planet configuration document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlanetDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<ManagerSection>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub atmosphere: Vec<ComponentEntry>,

    #[serde(default, rename = "flow", skip_serializing_if = "Vec::is_empty")]
    pub flows: Vec<FlowEntry>,
}

/// Manager-wide settings; applied only by the first document carrying them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManagerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Name of a bouncer registered with the manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bouncer: Option<String>,

    /// Plug socket to plug entries
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugs: BTreeMap<String, Vec<Value>>,
}

/// A flow and its components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEntry {
    pub name: String,

    #[serde(default, rename = "component")]
    pub components: Vec<ComponentEntry>,
}

impl FlowEntry {
    /// Avatar id of the component that provides the flow's master clock
    ///
    /// Only components needing synchronisation take part. An explicit
    /// `clock-master = true` wins, otherwise the first such component does.
    pub fn clock_master(&self) -> Option<String> {
        let synced: Vec<&ComponentEntry> = self
            .components
            .iter()
            .filter(|c| c.needs_synchronisation)
            .collect();
        synced
            .iter()
            .find(|c| c.clock_master == Some(true))
            .or_else(|| synced.first())
            .map(|c| avatar_id(&self.name, &c.name))
    }
}

/// Where an eater takes its data from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EaterEntry {
    /// Bare feed id; the alias is derived from the eater name
    Feed(String),
    /// Feed id with an explicit alias
    Aliased { feed: String, alias: String },
}

impl EaterEntry {
    pub fn feed(&self) -> &str {
        match self {
            EaterEntry::Feed(feed) => feed,
            EaterEntry::Aliased { feed, .. } => feed,
        }
    }
}

/// One component entry in a document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ComponentEntry {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub eater: BTreeMap<String, Vec<EaterEntry>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feed: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub virtual_feeds: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_master: Option<bool>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub needs_synchronisation: bool,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugs: BTreeMap<String, Vec<Value>>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub nice: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_version: Option<u32>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

impl ComponentEntry {
    /// Build the runtime configuration for this entry under `parent`
    pub fn to_config(&self, parent: &str, clock_master: Option<String>) -> ComponentConfig {
        let eater = self
            .eater
            .iter()
            .map(|(name, sources)| {
                let single = sources.len() == 1;
                let resolved = sources
                    .iter()
                    .enumerate()
                    .map(|(index, source)| match source {
                        EaterEntry::Aliased { feed, alias } => (feed.clone(), alias.clone()),
                        EaterEntry::Feed(feed) if single => (feed.clone(), name.clone()),
                        EaterEntry::Feed(feed) => (feed.clone(), format!("{}-{}", name, index)),
                    })
                    .collect();
                (name.clone(), resolved)
            })
            .collect();

        ComponentConfig {
            avatar_id: avatar_id(parent, &self.name),
            name: self.name.clone(),
            parent: parent.to_string(),
            kind: self.kind.clone(),
            worker: self.worker.clone(),
            project: self
                .project
                .clone()
                .unwrap_or_else(|| DEFAULT_PROJECT.to_string()),
            version: self.version.clone().unwrap_or_else(|| VERSION.to_string()),
            eater,
            feed: self.feed.clone(),
            virtual_feeds: self.virtual_feeds.clone(),
            clock_master,
            needs_synchronisation: self.needs_synchronisation,
            plugs: self.plugs.clone(),
            properties: self.properties.clone(),
            nice: self.nice,
        }
    }

    /// Rebuild a document entry from a runtime configuration
    pub fn from_config(config: &ComponentConfig) -> Self {
        let eater = config
            .eater
            .iter()
            .map(|(name, sources)| {
                let entries = sources
                    .iter()
                    .map(|(feed, alias)| EaterEntry::Aliased {
                        feed: feed.clone(),
                        alias: alias.clone(),
                    })
                    .collect();
                (name.clone(), entries)
            })
            .collect();
        let is_master = config.clock_master.as_deref() == Some(config.avatar_id.as_str());

        Self {
            name: config.name.clone(),
            kind: config.kind.clone(),
            worker: config.worker.clone(),
            project: Some(config.project.clone()),
            version: Some(config.version.clone()),
            eater,
            feed: config.feed.clone(),
            virtual_feeds: config.virtual_feeds.clone(),
            clock_master: is_master.then_some(true),
            needs_synchronisation: config.needs_synchronisation,
            properties: config.properties.clone(),
            plugs: config.plugs.clone(),
            nice: config.nice,
            config_version: Some(CONFIG_VERSION),
        }
    }
}

/// Runtime configuration of a component, as handed to workers and
/// reported back by the component after it logs in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    #[serde(rename = "avatarId")]
    pub avatar_id: String,

    pub name: String,

    pub parent: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub worker: Option<String>,

    #[serde(default)]
    pub project: String,

    #[serde(default)]
    pub version: String,

    /// Eater name to `(feedId, eaterAlias)` pairs
    #[serde(default)]
    pub eater: BTreeMap<String, Vec<(String, String)>>,

    #[serde(default)]
    pub feed: Vec<String>,

    /// Virtual feed id to the real feeder name
    #[serde(default, rename = "virtual-feeds")]
    pub virtual_feeds: BTreeMap<String, String>,

    /// Avatar id of the flow's clock master
    #[serde(default, rename = "clock-master")]
    pub clock_master: Option<String>,

    #[serde(default, rename = "needs-synchronisation")]
    pub needs_synchronisation: bool,

    #[serde(default)]
    pub plugs: BTreeMap<String, Vec<Value>>,

    #[serde(default)]
    pub properties: Map<String, Value>,

    #[serde(default)]
    pub nice: i32,
}

impl ComponentConfig {
    /// Minimal configuration for a component with no feeds
    pub fn new(parent: &str, name: &str, kind: &str) -> Self {
        Self {
            avatar_id: avatar_id(parent, name),
            name: name.to_string(),
            parent: parent.to_string(),
            kind: kind.to_string(),
            worker: None,
            project: DEFAULT_PROJECT.to_string(),
            version: VERSION.to_string(),
            eater: BTreeMap::new(),
            feed: Vec::new(),
            virtual_feeds: BTreeMap::new(),
            clock_master: None,
            needs_synchronisation: false,
            plugs: BTreeMap::new(),
            properties: Map::new(),
            nice: 0,
        }
    }

    /// Whether this component is the master clock of its flow
    pub fn is_clock_master(&self) -> bool {
        self.clock_master.as_deref() == Some(self.avatar_id.as_str())
    }

    /// All `(eaterAlias, feedId)` pairs this component eats
    pub fn eaten_feeds(&self) -> impl Iterator<Item = (&str, &str)> {
        self.eater
            .values()
            .flatten()
            .map(|(feed, alias)| (alias.as_str(), feed.as_str()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl PlanetDocument {
    /// Parse a TOML document, upgrading component entries first
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: toml::Value = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: None,
            message: e.to_string(),
        })?;
        let mut json = serde_json::to_value(raw).map_err(|e| ConfigError::Parse {
            path: None,
            message: e.to_string(),
        })?;

        if let Some(entries) = json.get_mut("atmosphere").and_then(Value::as_array_mut) {
            for entry in entries {
                upgrade::upgrade_entry(entry)?;
            }
        }
        if let Some(flows) = json.get_mut("flow").and_then(Value::as_array_mut) {
            for flow in flows {
                if let Some(entries) = flow.get_mut("component").and_then(Value::as_array_mut) {
                    for entry in entries {
                        upgrade::upgrade_entry(entry)?;
                    }
                }
            }
        }

        let document: PlanetDocument =
            serde_json::from_value(json).map_err(|e| ConfigError::Parse {
                path: None,
                message: e.to_string(),
            })?;
        document.validate()?;
        Ok(document)
    }

    /// Read and parse a TOML document from disk
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: Some(path.to_path_buf()),
                message,
            },
            other => other,
        })
    }

    /// Render this document as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for flow in &self.flows {
            if flow.name.is_empty() || flow.name == ATMOSPHERE {
                return Err(ConfigError::Invalid(format!(
                    "flow name {:?} is reserved or empty",
                    flow.name
                )));
            }
        }
        let entries = self
            .atmosphere
            .iter()
            .chain(self.flows.iter().flat_map(|f| f.components.iter()));
        for entry in entries {
            if entry.name.is_empty() || entry.name.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "invalid component name {:?}",
                    entry.name
                )));
            }
            if entry.kind.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "component {} has no type",
                    entry.name
                )));
            }
        }
        Ok(())
    }

    /// Every component config in the document, atmosphere first
    pub fn component_configs(&self) -> Vec<ComponentConfig> {
        let mut configs: Vec<ComponentConfig> = self
            .atmosphere
            .iter()
            .map(|entry| entry.to_config(ATMOSPHERE, None))
            .collect();
        for flow in &self.flows {
            let master = flow.clock_master();
            for entry in &flow.components {
                let clock_master = if entry.needs_synchronisation {
                    master.clone()
                } else {
                    None
                };
                configs.push(entry.to_config(&flow.name, clock_master));
            }
        }
        configs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DOC: &str = r#"
name = "studio"

[manager]
bouncer = "htpasswd"

[[atmosphere]]
name = "porter"
type = "porter"
worker = "w1"

[[flow]]
name = "f"

[[flow.component]]
name = "prod"
type = "videotest-producer"
worker = "w1"
feed = ["default"]
needs-synchronisation = true

[[flow.component]]
name = "enc"
type = "theora-encoder"
worker = "w2"
needs-synchronisation = true
clock-master = true
eater.default = [{ feed = "prod:default", alias = "default-prime" }]

[[flow.component]]
name = "mux"
type = "ogg-muxer"
eater.default = ["enc", "prod:default"]

[flow.component.properties]
bitrate = 400000
"#;

    #[test]
    fn test_parse_document() {
        let doc = PlanetDocument::from_toml_str(DOC).unwrap();

        assert_eq!(doc.name.as_deref(), Some("studio"));
        assert_eq!(
            doc.manager.as_ref().and_then(|m| m.bouncer.as_deref()),
            Some("htpasswd")
        );
        assert_eq!(doc.atmosphere.len(), 1);
        assert_eq!(doc.flows.len(), 1);
        assert_eq!(doc.flows[0].components.len(), 3);
    }

    #[test]
    fn test_component_configs() {
        let doc = PlanetDocument::from_toml_str(DOC).unwrap();
        let configs = doc.component_configs();

        assert_eq!(configs[0].avatar_id, "/atmosphere/porter");
        assert_eq!(configs[0].clock_master, None);

        let enc = &configs[2];
        assert_eq!(enc.avatar_id, "/f/enc");
        assert_eq!(
            enc.eater.get("default"),
            Some(&vec![("prod:default".to_string(), "default-prime".to_string())])
        );
        assert!(enc.is_clock_master());
        assert_eq!(configs[1].clock_master.as_deref(), Some("/f/enc"));

        let mux = &configs[3];
        assert_eq!(mux.clock_master, None);
        assert_eq!(
            mux.eater.get("default"),
            Some(&vec![
                ("enc".to_string(), "default-0".to_string()),
                ("prod:default".to_string(), "default-1".to_string()),
            ])
        );
        assert_eq!(mux.properties.get("bitrate"), Some(&Value::from(400000)));
    }

    #[test]
    fn test_single_eater_takes_eater_name() {
        let entry = ComponentEntry {
            name: "enc".into(),
            kind: "encoder".into(),
            eater: BTreeMap::from([(
                "video".to_string(),
                vec![EaterEntry::Feed("prod".into())],
            )]),
            ..Default::default()
        };
        let config = entry.to_config("f", None);
        assert_eq!(
            config.eaten_feeds().collect::<Vec<_>>(),
            vec![("video", "prod")]
        );
    }

    #[test]
    fn test_first_synced_component_is_default_master() {
        let flow = FlowEntry {
            name: "f".into(),
            components: vec![
                ComponentEntry {
                    name: "a".into(),
                    kind: "t".into(),
                    ..Default::default()
                },
                ComponentEntry {
                    name: "b".into(),
                    kind: "t".into(),
                    needs_synchronisation: true,
                    ..Default::default()
                },
            ],
        };
        assert_eq!(flow.clock_master().as_deref(), Some("/f/b"));
    }

    #[test]
    fn test_reject_reserved_flow_name() {
        let err = PlanetDocument::from_toml_str("[[flow]]\nname = \"atmosphere\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_reject_bad_toml() {
        let err = PlanetDocument::from_toml_str("[[flow]\nname = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_avatar_id_parsing() {
        assert_eq!(avatar_id("f1", "c1"), "/f1/c1");
        assert_eq!(parse_avatar_id("/f1/c1"), Some(("f1", "c1")));
        assert_eq!(parse_avatar_id("f1/c1"), None);
        assert_eq!(parse_avatar_id("/f1/c1/x"), None);
        assert_eq!(parse_avatar_id("/f1/"), None);
    }

    #[test]
    fn test_document_to_toml_and_back() {
        let doc = PlanetDocument::from_toml_str(DOC).unwrap();
        let configs = doc.component_configs();
        let rebuilt = PlanetDocument {
            name: doc.name.clone(),
            manager: None,
            atmosphere: vec![ComponentEntry::from_config(&configs[0])],
            flows: vec![FlowEntry {
                name: "f".into(),
                components: configs[1..]
                    .iter()
                    .map(ComponentEntry::from_config)
                    .collect(),
            }],
        };

        let text = rebuilt.to_toml_string().unwrap();
        let parsed = PlanetDocument::from_toml_str(&text).unwrap();
        assert_eq!(parsed.component_configs(), configs);
    }
}
