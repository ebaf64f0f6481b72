use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub version: String,
    /// Base directory holding one subdirectory per kernel version.
    pub kernels_dir: PathBuf,
    /// Pool used for volumes with no explicit or inherited pool.
    pub default_pool: String,
    /// Per-volume-name overrides of `default_pool`, e.g. `root`, `private`.
    #[serde(default)]
    pub default_pools: HashMap<String, String>,
    #[serde(default)]
    pub pools: Vec<PoolDefinition>,
}

/// One configured pool: which driver to use and its driver options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolDefinition {
    pub driver: String,
    pub name: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl PoolDefinition {
    pub fn new(driver: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            name: name.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

impl HostConfig {
    pub fn load() -> crate::Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> crate::Result<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            let config: HostConfig = serde_yaml::from_str(&content)
                .map_err(|e| crate::StorageError::ConfigError(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, config_path: &Path) -> crate::Result<()> {
        if let Some(config_dir) = config_path.parent() {
            std::fs::create_dir_all(config_dir)?;
        }

        let content = serde_yaml::to_string(self)
            .map_err(|e| crate::StorageError::ConfigError(e.to_string()))?;
        std::fs::write(config_path, content)?;

        Ok(())
    }

    pub fn config_path() -> crate::Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| {
            crate::StorageError::ConfigError("Cannot determine home directory".to_string())
        })?;
        Ok(home.join(".vmdisk").join("config.yaml"))
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vmdisk");

        Self {
            version: "1.0".to_string(),
            kernels_dir: data_dir.join("vm-kernels"),
            default_pool: "varlibvmdisk".to_string(),
            default_pools: HashMap::new(),
            pools: vec![
                PoolDefinition::new("file", "varlibvmdisk")
                    .with_option("dir_path", data_dir.join("pool").to_string_lossy()),
            ],
        }
    }
}
