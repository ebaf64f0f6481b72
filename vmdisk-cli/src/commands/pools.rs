use crate::output::OutputFormat;
use crate::utils::{format_size, format_usage_percent};
use serde::Serialize;
use std::sync::Arc;
use tabled::Tabled;
use tracing::debug;
use vmdisk_core::Result;
use vmdisk_storage::{Host, Pool};

#[derive(Serialize, Tabled)]
struct PoolRow {
    name: String,
    driver: String,
    size: String,
    usage: String,
    #[tabled(rename = "used")]
    percent: String,
    #[tabled(rename = "contained in")]
    contained_in: String,
}

async fn describe(host: &Host, pool: &Arc<dyn Pool>) -> PoolRow {
    let size = pool.size().await;
    let usage = pool.usage().await;
    let contained_in = host
        .containing_pool(pool.as_ref())
        .map(|parent| parent.name().to_string());
    debug!(pool = %pool.name(), ?size, ?usage, "Collected pool usage");

    PoolRow {
        name: pool.name().to_string(),
        driver: pool.driver().to_string(),
        size: format_size(size),
        usage: format_size(usage),
        percent: format_usage_percent(usage, size),
        contained_in: contained_in.unwrap_or_else(|| "-".to_string()),
    }
}

pub async fn execute(name: Option<String>, host: &Host, format: OutputFormat) -> Result<()> {
    let pools = match name {
        Some(name) => vec![host.get_pool(&name)?],
        None => host.pools(),
    };

    let mut rows = Vec::with_capacity(pools.len());
    for pool in &pools {
        rows.push(describe(host, pool).await);
    }

    println!("{}", format.rows(&rows, "No storage pools configured")?);
    Ok(())
}
