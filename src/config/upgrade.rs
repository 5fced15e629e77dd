//! Component entry upgraders
//!
//! Each upgrader takes an entry at version N to N+1. Entries without a
//! `config-version` are taken to be current.

use serde_json::{Map, Value};

use super::constants::CONFIG_VERSION;
use super::ConfigError;

type Upgrader = fn(&mut Map<String, Value>) -> Result<(), String>;

/// Upgraders indexed by the version they upgrade from
const UPGRADERS: &[Upgrader] = &[source_to_eater];

/// Bring a single component entry up to [`CONFIG_VERSION`]
pub fn upgrade_entry(entry: &mut Value) -> Result<(), ConfigError> {
    let Some(map) = entry.as_object_mut() else {
        return Err(ConfigError::Invalid(
            "component entry is not a table".to_string(),
        ));
    };

    let version = match map.get("config-version") {
        None => CONFIG_VERSION,
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| ConfigError::Invalid(format!("bad config-version {}", v)))?,
    };

    if version > CONFIG_VERSION {
        return Err(ConfigError::Upgrade {
            version,
            message: format!("newer than supported version {}", CONFIG_VERSION),
        });
    }

    for (from, upgrader) in UPGRADERS
        .iter()
        .enumerate()
        .skip(version as usize)
        .take((CONFIG_VERSION - version) as usize)
    {
        tracing::debug!(from = from, to = from + 1, "Upgrading component entry");
        upgrader(map).map_err(|message| ConfigError::Upgrade {
            version: from as u32,
            message,
        })?;
    }

    map.insert("config-version".to_string(), Value::from(CONFIG_VERSION));
    Ok(())
}

/// Version 0 listed upstream feeds in a flat `source` list; version 1
/// groups them under named eaters
fn source_to_eater(entry: &mut Map<String, Value>) -> Result<(), String> {
    let Some(source) = entry.remove("source") else {
        return Ok(());
    };
    let feeds = match source {
        Value::String(feed) => vec![Value::String(feed)],
        Value::Array(feeds) => feeds,
        other => return Err(format!("source must be a list of feeds, got {}", other)),
    };
    if entry.contains_key("eater") {
        return Err("entry has both source and eater".to_string());
    }

    let mut eater = Map::new();
    eater.insert("default".to_string(), Value::Array(feeds));
    entry.insert("eater".to_string(), Value::Object(eater));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_current_entry_untouched() {
        let mut entry = json!({"name": "enc", "type": "encoder", "eater": {"default": ["prod"]}});
        upgrade_entry(&mut entry).unwrap();

        assert_eq!(entry["eater"], json!({"default": ["prod"]}));
        assert_eq!(entry["config-version"], json!(CONFIG_VERSION));
    }

    #[test]
    fn test_upgrade_source_list() {
        let mut entry = json!({
            "name": "enc",
            "type": "encoder",
            "config-version": 0,
            "source": ["prod:video", "prod:audio"]
        });
        upgrade_entry(&mut entry).unwrap();

        assert!(entry.get("source").is_none());
        assert_eq!(
            entry["eater"],
            json!({"default": ["prod:video", "prod:audio"]})
        );
    }

    #[test]
    fn test_upgrade_single_source() {
        let mut entry = json!({"name": "enc", "type": "e", "config-version": 0, "source": "prod"});
        upgrade_entry(&mut entry).unwrap();
        assert_eq!(entry["eater"], json!({"default": ["prod"]}));
    }

    #[test]
    fn test_conflicting_source_and_eater() {
        let mut entry = json!({
            "name": "enc",
            "type": "e",
            "config-version": 0,
            "source": ["a"],
            "eater": {"default": ["b"]}
        });
        let err = upgrade_entry(&mut entry).unwrap_err();
        assert!(matches!(err, ConfigError::Upgrade { version: 0, .. }));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut entry = json!({"name": "enc", "type": "e", "config-version": CONFIG_VERSION + 1});
        assert!(matches!(
            upgrade_entry(&mut entry),
            Err(ConfigError::Upgrade { .. })
        ));
    }
}
