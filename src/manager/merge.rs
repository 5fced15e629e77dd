//! Configuration merging
//!
//! Documents are merged into the running planet component by component.
//! A running component is never replaced; a conflicting entry leaves a
//! planet warning carrying the configuration diff instead.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::worker::Creation;
use super::{Manager, ManagerInner};
use crate::config::diff;
use crate::config::document::ComponentConfig;
use crate::config::{ConfigError, ManagerSection, PlanetDocument};
use crate::error::{Error, Result};
use crate::state::{Message, Mood, NodeId, Planet, StateError};

/// What merging one component entry did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Created(NodeId),
    /// A sleeping component got the new configuration
    Replaced(NodeId),
    Unchanged(NodeId),
    /// Running with a different configuration; left alone
    Conflict(NodeId),
}

impl MergeOutcome {
    pub fn node(self) -> NodeId {
        match self {
            MergeOutcome::Created(node)
            | MergeOutcome::Replaced(node)
            | MergeOutcome::Unchanged(node)
            | MergeOutcome::Conflict(node) => node,
        }
    }

    /// Whether the component now carries the merged configuration anew
    pub fn is_fresh(self) -> bool {
        matches!(self, MergeOutcome::Created(_) | MergeOutcome::Replaced(_))
    }
}

/// Merge one component configuration into the planet
pub fn merge_component(
    planet: &mut Planet,
    config: &ComponentConfig,
) -> std::result::Result<MergeOutcome, StateError> {
    let id = config.avatar_id.as_str();
    let Some(node) = planet.find_component(id) else {
        let node = planet.add_component(config)?;
        tracing::debug!(component = id, "Created component");
        return Ok(MergeOutcome::Created(node));
    };

    let deltas = diff::diff(&planet.component_config_value(node), &config.to_value());
    if deltas.is_empty() {
        return Ok(MergeOutcome::Unchanged(node));
    }

    if planet.mood(node) == Some(Mood::Sleeping) {
        planet.set_component_config(node, config)?;
        tracing::debug!(component = id, changes = deltas.len(), "Replaced sleeping component");
        return Ok(MergeOutcome::Replaced(node));
    }

    let diff_text = diff::format(&deltas);
    tracing::warn!(component = id, diff = %diff_text, "Not replacing running component");
    planet.add_message(
        Message::warning(
            format!("loadComponent-{}", id),
            format!(
                "Component {} is already running with a different configuration. \
                 Stop it before loading the new one.",
                id
            ),
        )
        .with_debug(diff_text),
    )?;
    Ok(MergeOutcome::Conflict(node))
}

impl ManagerInner {
    /// Apply the first manager section; later ones only warn
    fn apply_manager_section(&mut self, section: &ManagerSection) {
        if self.manager_section.is_some() {
            tracing::warn!("Manager section already applied, ignoring");
            return;
        }
        if let Some(name) = section.bouncer.as_deref() {
            match self.bouncers.get(name) {
                Some(bouncer) => {
                    tracing::info!(bouncer = name, "Using bouncer");
                    self.bouncer = Some(bouncer.clone());
                }
                None => {
                    tracing::warn!(bouncer = name, "No such bouncer registered");
                    let _ = self.planet.add_message(Message::warning(
                        "manager-bouncer",
                        format!("Bouncer {} is not registered with the manager.", name),
                    ));
                }
            }
        }
        self.manager_section = Some(section.clone());
    }

    /// Merge `configs`, marking fresh ones to start and queueing their
    /// creations per worker
    fn merge_configs(&mut self, configs: &[ComponentConfig]) -> Result<Vec<MergeOutcome>> {
        let mut outcomes = Vec::with_capacity(configs.len());
        let mut creations: BTreeMap<String, Vec<Creation>> = BTreeMap::new();

        for config in configs {
            let outcome = merge_component(&mut self.planet, config)?;
            if outcome.is_fresh() {
                if let Some(worker) = config.worker.as_deref() {
                    self.planet
                        .set_mood_pending(outcome.node(), Some(Mood::Happy))?;
                    if let Some(creation) = Creation::for_component(&self.planet, outcome.node()) {
                        creations.entry(worker.to_string()).or_default().push(creation);
                    }
                }
            }
            outcomes.push(outcome);
        }

        for (worker, batch) in creations {
            if !self.workers.is_logged_in(&worker) {
                tracing::debug!(worker = %worker, pending = batch.len(), "Worker not logged in, creations stay pending");
                continue;
            }
            tracing::debug!(worker = %worker, count = batch.len(), "Queueing creations");
            for creation in batch {
                self.enqueue_creation(&worker, creation);
            }
        }
        Ok(outcomes)
    }
}

impl Manager {
    /// Merge a parsed planet document
    pub fn load_configuration(&self, document: &PlanetDocument) -> Result<Vec<MergeOutcome>> {
        let mut inner = self.lock();
        if let Some(section) = &document.manager {
            inner.apply_manager_section(section);
        }
        let outcomes = inner.merge_configs(&document.component_configs())?;
        tracing::info!(
            components = outcomes.len(),
            conflicts = outcomes.iter().filter(|o| matches!(o, MergeOutcome::Conflict(_))).count(),
            "Loaded configuration"
        );
        Ok(outcomes)
    }

    /// Parse a TOML planet document and merge it
    pub fn load_configuration_str(&self, text: &str) -> Result<()> {
        let document = PlanetDocument::from_toml_str(text)?;
        self.load_configuration(&document)?;
        Ok(())
    }

    /// Load a single component; returns its avatar id
    ///
    /// `eaters` are `(feedId, eaterName)` pairs. An eater fed from one feed
    /// uses its name as alias, otherwise `{eaterName}-{index}`.
    #[allow(clippy::too_many_arguments)]
    pub fn load_component(
        &self,
        kind: &str,
        parent: &str,
        name: &str,
        worker: Option<String>,
        properties: Map<String, Value>,
        eaters: Vec<(String, String)>,
        needs_synchronisation: bool,
    ) -> Result<String> {
        if needs_synchronisation {
            return Err(Error::NotImplemented(
                "loading components that need clock synchronisation".to_string(),
            ));
        }
        if name.is_empty() || name.contains('/') || parent.is_empty() || parent.contains('/') {
            return Err(ConfigError::Invalid(format!("invalid component {}/{}", parent, name)).into());
        }
        if kind.is_empty() {
            return Err(ConfigError::Invalid(format!("component {} has no type", name)).into());
        }

        let mut config = ComponentConfig::new(parent, name, kind);
        config.worker = worker;
        config.properties = properties;

        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (feed, eater) in eaters {
            grouped.entry(eater).or_default().push(feed);
        }
        config.eater = grouped
            .into_iter()
            .map(|(eater, feeds)| {
                let single = feeds.len() == 1;
                let sources = feeds
                    .into_iter()
                    .enumerate()
                    .map(|(index, feed)| {
                        let alias = if single {
                            eater.clone()
                        } else {
                            format!("{}-{}", eater, index)
                        };
                        (feed, alias)
                    })
                    .collect();
                (eater, sources)
            })
            .collect();

        let id = config.avatar_id.clone();
        let outcome = self
            .lock()
            .merge_configs(std::slice::from_ref(&config))?;
        tracing::info!(component = %id, outcome = ?outcome.first(), "Loaded component");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::state::MessageLevel;
    use pretty_assertions::assert_eq;

    const DOC: &str = r#"
[[atmosphere]]
name = "porter"
type = "porter"
worker = "w1"

[[flow]]
name = "f1"

[[flow.component]]
name = "c1"
type = "videotest-producer"
worker = "w1"

[flow.component.properties]
width = 320
"#;

    #[test]
    fn test_merge_is_idempotent() {
        let manager = Manager::new(ManagerConfig::default());
        let document = PlanetDocument::from_toml_str(DOC).unwrap();

        let first = manager.load_configuration(&document).unwrap();
        assert!(first.iter().all(|o| matches!(o, MergeOutcome::Created(_))));
        let before = manager.planet_snapshot();

        let second = manager.load_configuration(&document).unwrap();
        assert!(second.iter().all(|o| matches!(o, MergeOutcome::Unchanged(_))));
        assert_eq!(manager.planet_snapshot(), before);
    }

    #[test]
    fn test_sleeping_component_is_replaced() {
        let manager = Manager::new(ManagerConfig::default());
        manager.load_configuration_str(DOC).unwrap();

        let changed = DOC.replace("width = 320", "width = 640");
        let document = PlanetDocument::from_toml_str(&changed).unwrap();
        let outcomes = manager.load_configuration(&document).unwrap();
        assert!(matches!(outcomes[1], MergeOutcome::Replaced(_)));

        let width = manager.with_planet(|p| {
            let node = p.find_component("/f1/c1").unwrap();
            p.component_config(node).unwrap().properties["width"].clone()
        });
        assert_eq!(width, serde_json::json!(640));
    }

    #[test]
    fn test_running_component_conflict_leaves_warning() {
        let manager = Manager::new(ManagerConfig::default());
        manager.load_configuration_str(DOC).unwrap();
        let node = manager.with_planet(|p| p.find_component("/f1/c1").unwrap());
        manager.lock().planet.set_mood(node, Mood::Happy).unwrap();
        let before = manager.with_planet(|p| p.component_config_value(node));

        let changed = DOC.replace("width = 320", "width = 640");
        let document = PlanetDocument::from_toml_str(&changed).unwrap();
        let outcomes = manager.load_configuration(&document).unwrap();
        assert_eq!(outcomes[1], MergeOutcome::Conflict(node));

        assert_eq!(manager.with_planet(|p| p.component_config_value(node)), before);
        let warning = manager.planet_message("loadComponent-/f1/c1").unwrap();
        assert_eq!(warning.level, MessageLevel::Warning);
        assert!(warning.debug.unwrap().contains("width"));
    }

    #[test]
    fn test_fresh_components_pending_happy() {
        let manager = Manager::new(ManagerConfig::default());
        manager
            .load_configuration_str(
                "[[flow]]\nname = \"f\"\n\n[[flow.component]]\nname = \"orphan\"\ntype = \"tester\"\n",
            )
            .unwrap();
        manager.load_configuration_str(DOC).unwrap();

        assert_eq!(manager.component("/f1/c1").unwrap().mood_pending, Some(Mood::Happy));
        assert_eq!(manager.component("/atmosphere/porter").unwrap().mood_pending, Some(Mood::Happy));
        // No worker requested, nothing to start it on
        assert_eq!(manager.component("/f/orphan").unwrap().mood_pending, None);
    }

    #[test]
    fn test_second_manager_section_ignored() {
        let manager = Manager::new(ManagerConfig::default());
        manager
            .load_configuration_str("[manager]\nbouncer = \"missing\"\n")
            .unwrap();
        assert!(manager.planet_message("manager-bouncer").is_some());

        manager
            .load_configuration_str("[manager]\nname = \"other\"\n")
            .unwrap();
        assert_eq!(
            manager.lock().manager_section.as_ref().unwrap().bouncer.as_deref(),
            Some("missing")
        );
    }

    #[test]
    fn test_load_component_aliases() {
        let manager = Manager::new(ManagerConfig::default());
        let id = manager
            .load_component(
                "muxer",
                "f",
                "mux",
                None,
                Map::new(),
                vec![
                    ("audio:default".to_string(), "default".to_string()),
                    ("video:default".to_string(), "default".to_string()),
                    ("sub".to_string(), "subtitles".to_string()),
                ],
                false,
            )
            .unwrap();
        assert_eq!(id, "/f/mux");

        let config = manager.with_planet(|p| p.component_config(p.find_component(&id).unwrap()).unwrap());
        assert_eq!(
            config.eater["default"],
            vec![
                ("audio:default".to_string(), "default-0".to_string()),
                ("video:default".to_string(), "default-1".to_string()),
            ]
        );
        assert_eq!(
            config.eater["subtitles"],
            vec![("sub".to_string(), "subtitles".to_string())]
        );
    }

    #[test]
    fn test_load_component_refuses_synchronised() {
        let manager = Manager::new(ManagerConfig::default());
        let err = manager
            .load_component("producer", "f", "p", None, Map::new(), vec![], true)
            .unwrap_err();
        assert!(matches!(err, Error::NotImplemented(_)));
        assert!(manager
            .load_component("producer", "f", "a/b", None, Map::new(), vec![], false)
            .is_err());
    }
}
