//! Thin typed layer over the host's /dev/kvm ioctl surface.
//!
//! KVM exposes three levels of handles, each with its own ioctl set:
//!
//! - `/dev/kvm` itself - subsystem-level operations (API version, supported
//!   CPUID, VM creation)
//! - the VM file descriptor - machine-level operations (memory slots,
//!   interrupt controllers, control-structure placement, vCPU creation)
//! - the vCPU file descriptor - per-CPU operations (register snapshots,
//!   CPUID installation, `run`)
//!
//! The wrappers in this module add two things on top of `kvm_ioctls`: the
//! crate's error taxonomy, and the ordering guards machine setup requires
//! (control structures must be placed before the first vCPU exists). The
//! run-state shared with the host kernel is mapped and decoded by
//! `kvm_ioctls`; I/O exits hand out the byte slice at the run-state's
//! `data_offset` directly.

mod cpuid;
mod vcpu;
mod vm;

pub use cpuid::{shape_cpuid, supported_cpuid, KVM_CPUID_SIGNATURE};
pub use vcpu::{PortIoHandler, Vcpu, VcpuExit};
pub use vm::Vm;

use crate::error::{Result, VmmError};
use kvm_ioctls::Kvm;

/// Guest page size. The control structures above guest RAM are sized in
/// these units: three pages of TSS plus one identity-map page.
pub const PAGE_SIZE: u64 = 0x1000;

/// The only KVM API version this VMM speaks.
pub const API_VERSION: i32 = 12;

/// Open the KVM subsystem handle and verify its API version.
///
/// KVM's API version has been frozen at 12 since Linux 2.6.22; anything
/// else means a kernel whose ioctl layout we do not understand, so refuse
/// to continue.
pub fn open() -> Result<Kvm> {
    let kvm = Kvm::new().map_err(|e| VmmError::IoctlFailed("open /dev/kvm", e))?;

    let version = kvm.get_api_version();
    if version != API_VERSION {
        return Err(VmmError::ApiIncompatible(version));
    }

    Ok(kvm)
}

/// Whether this host can run KVM tests at all.
#[cfg(test)]
pub(crate) fn kvm_available() -> bool {
    std::path::Path::new("/dev/kvm").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_version_is_12() {
        if !kvm_available() {
            return;
        }
        let kvm = Kvm::new().unwrap();
        assert_eq!(kvm.get_api_version(), API_VERSION);
        assert!(open().is_ok());
    }
}
