//! Typed per-capability configuration.
//!
//! Each capability declares the keys it accepts, and a composition request may
//! only supply values for declared keys with a matching type. Values are a
//! closed set of scalars and scalar lists, never nested maps.
//!
//! ```yaml
//! config:
//!   retention_days: { type: integer, default: 30 }
//!   archive_dir:    { type: string, required: true }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A scalar configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigScalar {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

/// A configuration value: a scalar or a flat list of scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<ConfigScalar>),
}

impl ConfigValue {
    pub fn kind(&self) -> ConfigKind {
        match self {
            ConfigValue::Bool(_) => ConfigKind::Boolean,
            ConfigValue::Integer(_) => ConfigKind::Integer,
            ConfigValue::Float(_) => ConfigKind::Float,
            ConfigValue::String(_) => ConfigKind::String,
            ConfigValue::List(_) => ConfigKind::List,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Coerce into `kind`, widening integers to floats. Returns `None` when
    /// the value does not fit.
    fn coerce(&self, kind: ConfigKind) -> Option<ConfigValue> {
        match (self, kind) {
            (ConfigValue::Integer(i), ConfigKind::Float) => Some(ConfigValue::Float(*i as f64)),
            (value, kind) if value.kind() == kind => Some(value.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{}", b),
            ConfigValue::Integer(i) => write!(f, "{}", i),
            ConfigValue::Float(x) => write!(f, "{}", x),
            ConfigValue::String(s) => write!(f, "{:?}", s),
            ConfigValue::List(items) => write!(f, "[{} items]", items.len()),
        }
    }
}

/// Declared type of a configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKind {
    String,
    Integer,
    Float,
    Boolean,
    List,
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfigKind::String => "string",
            ConfigKind::Integer => "integer",
            ConfigKind::Float => "float",
            ConfigKind::Boolean => "boolean",
            ConfigKind::List => "list",
        };
        f.write_str(s)
    }
}

/// Declaration of one configuration key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    #[serde(rename = "type")]
    pub kind: ConfigKind,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ConfigValue>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Check a supplied config map against a capability's declared schema.
///
/// On success returns the effective config: supplied values (coerced to the
/// declared type) plus defaults for keys that were not supplied. On failure
/// returns one message per problem found.
pub fn check_config(
    schema: &BTreeMap<String, ConfigField>,
    supplied: &BTreeMap<String, ConfigValue>,
) -> Result<BTreeMap<String, ConfigValue>, Vec<String>> {
    let mut problems = Vec::new();
    let mut effective = BTreeMap::new();

    for (key, value) in supplied {
        match schema.get(key) {
            None => problems.push(format!("unknown config key '{}'", key)),
            Some(field) => match value.coerce(field.kind) {
                Some(coerced) => {
                    effective.insert(key.clone(), coerced);
                }
                None => problems.push(format!(
                    "config key '{}' expects {} but got {}",
                    key,
                    field.kind,
                    value.kind()
                )),
            },
        }
    }

    for (key, field) in schema {
        if supplied.contains_key(key) {
            continue;
        }
        match &field.default {
            Some(default) => {
                effective.insert(key.clone(), default.clone());
            }
            None if field.required => {
                problems.push(format!("missing required config key '{}'", key))
            }
            None => {}
        }
    }

    if problems.is_empty() {
        Ok(effective)
    } else {
        Err(problems)
    }
}

/// Structural check of a schema declaration itself (defaults must match).
pub(crate) fn check_schema(schema: &BTreeMap<String, ConfigField>) -> Vec<String> {
    schema
        .iter()
        .filter_map(|(key, field)| {
            let default = field.default.as_ref()?;
            if default.coerce(field.kind).is_some() {
                None
            } else {
                Some(format!(
                    "config key '{}' declares type {} but its default is {}",
                    key,
                    field.kind,
                    default.kind()
                ))
            }
        })
        .collect()
}
