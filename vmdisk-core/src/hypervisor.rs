use crate::error::Result;
use crate::types::DiskDescriptor;
use async_trait::async_trait;

/// Control plane that owns the live device-attachment state of each VM.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn current_descriptors(&self, vm: &str) -> Result<Vec<DiskDescriptor>>;
    async fn attach(&self, vm: &str, disk: &DiskDescriptor) -> Result<()>;
    async fn detach(&self, vm: &str, disk: &DiskDescriptor) -> Result<()>;
    async fn is_running(&self, vm: &str) -> bool;
    fn name(&self) -> &str;
}

/// Failure reported by a guest service call.
#[derive(Debug, Clone, Default)]
pub struct ServiceFailure {
    pub exit_code: Option<i32>,
    pub stderr: Vec<u8>,
}

/// Remote procedure channel into a running guest.
#[async_trait]
pub trait GuestService: Send + Sync {
    async fn run_service(
        &self,
        vm: &str,
        service: &str,
        input: &[u8],
        user: &str,
    ) -> std::result::Result<Vec<u8>, ServiceFailure>;
}

/// Hypervisor for hosts with no running VMs, e.g. offline inspection tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineHypervisor;

#[async_trait]
impl Hypervisor for OfflineHypervisor {
    async fn current_descriptors(&self, _vm: &str) -> Result<Vec<DiskDescriptor>> {
        Ok(vec![])
    }

    async fn attach(&self, vm: &str, _disk: &DiskDescriptor) -> Result<()> {
        Err(crate::StorageError::DomainNotRunning(vm.to_string()))
    }

    async fn detach(&self, vm: &str, _disk: &DiskDescriptor) -> Result<()> {
        Err(crate::StorageError::DomainNotRunning(vm.to_string()))
    }

    async fn is_running(&self, _vm: &str) -> bool {
        false
    }

    fn name(&self) -> &str {
        "offline"
    }
}

#[async_trait]
impl GuestService for OfflineHypervisor {
    async fn run_service(
        &self,
        _vm: &str,
        service: &str,
        _input: &[u8],
        _user: &str,
    ) -> std::result::Result<Vec<u8>, ServiceFailure> {
        Err(ServiceFailure {
            exit_code: None,
            stderr: format!("{service}: VM is not running").into_bytes(),
        })
    }
}
