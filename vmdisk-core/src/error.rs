use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid configuration for volume {volume}: {message}")]
    InvalidConfig { volume: String, message: String },

    #[error("{subject} has {method}() not implemented")]
    NotImplemented {
        subject: String,
        method: &'static str,
    },

    #[error("No unused frontend found")]
    NoFreeFrontend,

    #[error("Volume {0} not found")]
    VolumeNotFound(String),

    #[error("Volume {0} is not attached")]
    NotAttached(String),

    #[error("Storage pool {0} not found")]
    PoolNotFound(String),

    #[error("Storage driver {0} not found")]
    DriverNotFound(String),

    #[error("Capacity error for volume {volume}: {message}")]
    Capacity { volume: String, message: String },

    #[error("VM directory does not exist: {}", path.display())]
    DomainDirMissing { vm: String, path: PathBuf },

    #[error("VM {0} is not running")]
    DomainNotRunning(String),

    #[error("VM {0} no longer exists")]
    DomainGone(String),

    #[error("Storage pool error: {0}")]
    Pool(String),

    #[error("{} volume operations failed: {}", .0.len(), join_messages(.0))]
    Aggregate(Vec<StorageError>),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    pub fn not_implemented(subject: impl Into<String>, method: &'static str) -> Self {
        StorageError::NotImplemented {
            subject: subject.into(),
            method,
        }
    }

    /// True when a backend simply lacks the requested capability.
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, StorageError::NotImplemented { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::VolumeNotFound(_)
                | StorageError::NotAttached(_)
                | StorageError::PoolNotFound(_)
                | StorageError::DriverNotFound(_)
        )
    }

    /// Every individual failure, flattening nested aggregates.
    pub fn failures(&self) -> Vec<&StorageError> {
        match self {
            StorageError::Aggregate(errors) => errors.iter().flat_map(|e| e.failures()).collect(),
            other => vec![other],
        }
    }
}

fn join_messages(errors: &[StorageError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
