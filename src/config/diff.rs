//! Structured differences between two component configurations

use std::fmt;

use serde_json::Value;

/// What happened to a single configuration key
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaKind {
    Added(Value),
    Removed(Value),
    Changed { old: Value, new: Value },
}

/// One difference, addressed by a dotted path (`properties.bitrate`)
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDelta {
    pub path: String,
    pub kind: DeltaKind,
}

impl fmt::Display for ConfigDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DeltaKind::Added(value) => write!(f, "+ {}: {}", self.path, value),
            DeltaKind::Removed(value) => write!(f, "- {}: {}", self.path, value),
            DeltaKind::Changed { old, new } => {
                write!(f, "~ {}: {} -> {}", self.path, old, new)
            }
        }
    }
}

/// Compute the differences going from `old` to `new`
///
/// Objects are compared key by key and arrays of equal length element by
/// element; anything else is reported as a whole-value change.
pub fn diff(old: &Value, new: &Value) -> Vec<ConfigDelta> {
    let mut deltas = Vec::new();
    walk("", old, new, &mut deltas);
    deltas
}

/// Render deltas one per line
pub fn format(deltas: &[ConfigDelta]) -> String {
    deltas
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn walk(path: &str, old: &Value, new: &Value, out: &mut Vec<ConfigDelta>) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, old_value) in a {
                let child = join(path, key);
                match b.get(key) {
                    Some(new_value) => walk(&child, old_value, new_value, out),
                    None => out.push(ConfigDelta {
                        path: child,
                        kind: DeltaKind::Removed(old_value.clone()),
                    }),
                }
            }
            for (key, new_value) in b {
                if !a.contains_key(key) {
                    out.push(ConfigDelta {
                        path: join(path, key),
                        kind: DeltaKind::Added(new_value.clone()),
                    });
                }
            }
        }
        (Value::Array(a), Value::Array(b)) if a.len() == b.len() => {
            for (index, (old_item, new_item)) in a.iter().zip(b).enumerate() {
                walk(&format!("{}[{}]", path, index), old_item, new_item, out);
            }
        }
        _ if old == new => {}
        _ => out.push(ConfigDelta {
            path: path.to_string(),
            kind: DeltaKind::Changed {
                old: old.clone(),
                new: new.clone(),
            },
        }),
    }
}
