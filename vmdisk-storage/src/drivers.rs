use crate::file::FilePool;
use crate::pool::Pool;
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::Arc;
use vmdisk_core::{PoolDefinition, Result, StorageError};

pub type PoolFactory = fn(&PoolDefinition) -> Result<Arc<dyn Pool>>;

#[derive(Clone)]
pub struct DriverEntry {
    /// Constructor parameters, without the identity parameter `name`.
    pub parameters: &'static [&'static str],
    pub factory: PoolFactory,
}

/// Maps driver names to pool constructors.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, DriverEntry>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the drivers shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("file", FilePool::PARAMETERS, FilePool::from_definition);
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        parameters: &'static [&'static str],
        factory: PoolFactory,
    ) {
        self.drivers.insert(
            name.into(),
            DriverEntry {
                parameters,
                factory,
            },
        );
    }

    /// Registered driver names, sorted.
    pub fn drivers(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }

    pub fn parameters(&self, driver: &str) -> Result<Vec<&'static str>> {
        let entry = self.entry(driver)?;
        Ok(entry
            .parameters
            .iter()
            .copied()
            .filter(|p| *p != "name")
            .collect())
    }

    pub fn instantiate(&self, definition: &PoolDefinition) -> Result<Arc<dyn Pool>> {
        let entry = self.entry(&definition.driver)?;

        if let Some(unknown) = definition
            .options
            .keys()
            .find(|key| !entry.parameters.contains(&key.as_str()))
        {
            return Err(StorageError::ConfigError(format!(
                "Driver {} does not accept parameter {unknown}",
                definition.driver
            )));
        }

        (entry.factory)(definition)
    }

    fn entry(&self, driver: &str) -> Result<&DriverEntry> {
        self.drivers
            .get(driver)
            .ok_or_else(|| StorageError::DriverNotFound(driver.to_string()))
    }
}

static BUILTIN_DRIVERS: Lazy<DriverRegistry> = Lazy::new(DriverRegistry::with_builtin);

/// Process-wide registry of the built-in drivers.
pub fn builtin_drivers() -> &'static DriverRegistry {
    &BUILTIN_DRIVERS
}
