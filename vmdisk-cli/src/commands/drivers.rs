use crate::output::OutputFormat;
use serde::Serialize;
use tabled::Tabled;
use vmdisk_core::Result;
use vmdisk_storage::{driver_parameters, pool_drivers};

#[derive(Serialize, Tabled)]
struct DriverRow {
    driver: String,
    parameters: String,
}

pub async fn execute(format: OutputFormat) -> Result<()> {
    let mut rows = Vec::new();
    for driver in pool_drivers() {
        rows.push(DriverRow {
            driver: driver.to_string(),
            parameters: driver_parameters(driver)?.join(", "),
        });
    }

    println!("{}", format.rows(&rows, "No pool drivers registered")?);
    Ok(())
}
