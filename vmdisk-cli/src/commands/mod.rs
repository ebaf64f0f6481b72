mod drivers;
mod locate;
mod pools;

use crate::output::OutputFormat;
use clap::Subcommand;
use std::path::PathBuf;
use std::sync::Arc;
use vmdisk_core::{HostConfig, OfflineHypervisor, Result};
use vmdisk_storage::{DriverRegistry, Host};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List storage drivers and the parameters they accept
    Drivers,

    /// List configured storage pools with their size and usage
    Pools {
        /// Name of a single pool to show
        name: Option<String>,
    },

    /// Find the pool that physically contains a directory
    Locate {
        /// Directory to look up
        dir: PathBuf,
    },
}

/// Host for read-only inspection, with no running VMs.
fn offline_host(config: &HostConfig) -> Result<Host> {
    Host::new(
        config,
        DriverRegistry::with_builtin(),
        Arc::new(OfflineHypervisor),
        Arc::new(OfflineHypervisor),
    )
}

pub async fn execute(command: Command, config: HostConfig, format: OutputFormat) -> Result<()> {
    match command {
        Command::Drivers => drivers::execute(format).await,
        Command::Pools { name } => pools::execute(name, &offline_host(&config)?, format).await,
        Command::Locate { dir } => locate::execute(dir, &offline_host(&config)?, format).await,
    }
}
