mod commands;
mod output;
mod utils;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vmdisk_core::HostConfig;

#[derive(Parser, Debug)]
#[command(name = "vmdisk")]
#[command(about = "vmdisk - inspect VM storage pools and their drivers", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    #[arg(short, long, global = true, help = "Verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Quiet output")]
    quiet: bool,

    #[arg(
        long,
        global = true,
        help = "Output format",
        value_enum,
        default_value = "table"
    )]
    format: output::OutputFormat,

    #[arg(
        long,
        global = true,
        env = "VMDISK_CONFIG",
        help = "Path to the host configuration file (default: ~/.vmdisk/config.yaml)"
    )]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => HostConfig::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => HostConfig::load().context("Failed to load host configuration")?,
    };

    if let Err(e) = commands::execute(cli.command, config, cli.format).await {
        output::print_error(&e.to_string());
        std::process::exit(1);
    }
    Ok(())
}
