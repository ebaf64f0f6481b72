use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Scalar value of a volume or pool configuration dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Accepts native booleans as well as the serialized `"True"`/`"False"` forms.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            ConfigValue::Int(i) => Some(*i != 0),
            ConfigValue::Str(s) => match s.as_str() {
                "True" | "true" | "1" => Some(true),
                "False" | "false" | "0" | "" => Some(false),
                _ => None,
            },
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ConfigValue::Int(i) => u64::try_from(*i).ok(),
            ConfigValue::Str(s) => s.parse().ok(),
            ConfigValue::Bool(_) => None,
        }
    }
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValue::Bool(true) => write!(f, "True"),
            ConfigValue::Bool(false) => write!(f, "False"),
            ConfigValue::Int(i) => write!(f, "{i}"),
            ConfigValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Str(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::Str(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<u64> for ConfigValue {
    fn from(value: u64) -> Self {
        ConfigValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<u32> for ConfigValue {
    fn from(value: u32) -> Self {
        ConfigValue::Int(i64::from(value))
    }
}

pub type ConfigMap = BTreeMap<String, ConfigValue>;

/// Renders a config dictionary into its persisted string form.
///
/// `true` is written as `"True"` and `false` entries are left out entirely;
/// existing persisted configuration depends on this asymmetry.
pub fn sanitize_config(config: &ConfigMap) -> BTreeMap<String, String> {
    config
        .iter()
        .filter_map(|(key, value)| match value {
            ConfigValue::Bool(false) => None,
            other => Some((key.clone(), other.to_string())),
        })
        .collect()
}

/// Descriptor handed to the hypervisor boundary for one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub path: PathBuf,
    pub name: String,
    pub script: Option<String>,
    pub rw: bool,
    pub domain: Option<String>,
    pub devtype: String,
}

impl BlockDevice {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            script: None,
            rw: true,
            domain: None,
            devtype: "disk".to_string(),
        }
    }
}

/// A device-attachment record as the hypervisor reports and accepts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    #[serde(rename = "type")]
    pub disk_type: String,
    pub device: String,
    pub driver: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_domain: Option<String>,
}

impl DiskDescriptor {
    /// Physical block disk for the volume `vid`, exposed to the guest as `target`.
    pub fn block(vid: &str, target: impl Into<String>, rw: bool) -> Self {
        Self {
            disk_type: "block".to_string(),
            device: "disk".to_string(),
            driver: "phy".to_string(),
            source: Self::source_for(vid),
            target: target.into(),
            readonly: !rw,
            backend_domain: None,
        }
    }

    pub fn with_backend_domain(mut self, domain: Option<String>) -> Self {
        self.backend_domain = domain;
        self
    }

    pub fn source_for(vid: &str) -> String {
        format!("/dev/{vid}")
    }

    pub fn to_document(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
