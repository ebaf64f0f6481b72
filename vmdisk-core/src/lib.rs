pub mod config;
pub mod error;
pub mod hypervisor;
pub mod types;


pub use config::*;
pub use error::*;
pub use hypervisor::*;
pub use types::*;
