use clap::ValueEnum;
use colored::*;
use serde::Serialize;
use tabled::{Table, Tabled};
use vmdisk_core::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

impl OutputFormat {
    /// Serializes `data` for the machine-readable formats. `Table` has no
    /// document form and falls back to JSON.
    pub fn document<T: Serialize>(self, data: &T) -> Result<String> {
        match self {
            OutputFormat::Table | OutputFormat::Json => Ok(serde_json::to_string_pretty(data)?),
            OutputFormat::Yaml => serde_yaml::to_string(data).map_err(|e| StorageError::Other(e.into())),
        }
    }

    /// Renders `rows` as a table, or as a document listing them.
    pub fn rows<T: Tabled + Serialize>(self, rows: &[T], empty: &str) -> Result<String> {
        match self {
            OutputFormat::Table if rows.is_empty() => Ok(empty.to_string()),
            OutputFormat::Table => Ok(Table::new(rows).to_string()),
            _ => self.document(&rows),
        }
    }
}

/// Human-readable outcome of a lookup: a check mark when something was found.
pub fn status(found: bool, message: &str) -> String {
    if found {
        format!("{} {}", "✓".green(), message)
    } else {
        format!("{} {}", "⚠".yellow(), message)
    }
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red(), message);
}
