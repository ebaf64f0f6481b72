use crate::output::{OutputFormat, status};
use serde::Serialize;
use std::path::PathBuf;
use vmdisk_core::Result;
use vmdisk_storage::{Host, search_pool_containing_dir};

#[derive(Serialize)]
struct Location {
    dir: PathBuf,
    pool: Option<String>,
    driver: Option<String>,
}

impl Location {
    fn describe(&self) -> String {
        match (&self.pool, &self.driver) {
            (Some(pool), Some(driver)) => {
                format!("{} is in pool {pool} (driver {driver})", self.dir.display())
            }
            _ => format!("No pool contains {}", self.dir.display()),
        }
    }
}

pub async fn execute(dir: PathBuf, host: &Host, format: OutputFormat) -> Result<()> {
    let found = search_pool_containing_dir(&host.pools(), &dir);
    let location = Location {
        pool: found.as_ref().map(|pool| pool.name().to_string()),
        driver: found.as_ref().map(|pool| pool.driver().to_string()),
        dir,
    };

    let rendered = match format {
        OutputFormat::Table => status(found.is_some(), &location.describe()),
        _ => format.document(&location)?,
    };
    println!("{rendered}");
    Ok(())
}
