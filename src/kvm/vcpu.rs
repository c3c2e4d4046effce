//! Virtual CPU management and execution.
//!
//! A vCPU alternates between two worlds: the VMM calls the blocking `run`
//! ioctl, the guest executes until something needs host attention, and the
//! kernel returns with an exit reason recorded in the shared run-state.
//! For port I/O exits the run-state also carries an I/O sub-record
//! (direction, access size, port, count, data offset); `kvm_ioctls`
//! resolves that record into the byte slice the guest is reading into or
//! writing from, which we hand straight to the device layer.
//!
//! The exits this VMM services:
//!
//! - **IO**: route to the port I/O handler, then resume.
//! - **HLT / SHUTDOWN**: the guest is done; leave the run loop cleanly.
//! - anything else: surface to the caller as unexpected.
//!
//! `run` is a bounded critical section owned by the calling thread; no
//! other thread may touch the vCPU fd while it is inside the ioctl.

use crate::error::{Result, VmmError};
use kvm_bindings::{kvm_regs, kvm_sregs, kvm_translation, CpuId, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::VcpuExit as KvmVcpuExit;

/// Handler for guest port I/O, called from inside exit servicing while the
/// vCPU is stopped.
pub trait PortIoHandler {
    /// The guest executed IN: fill `data` with the port's response.
    fn pio_in(&mut self, port: u16, data: &mut [u8]);

    /// The guest executed OUT: `data` is what it wrote.
    fn pio_out(&mut self, port: u16, data: &[u8]);
}

/// Decoded result of one `run` invocation.
#[derive(Debug)]
pub enum VcpuExit {
    /// A port I/O exit that has already been serviced by the handler.
    Io,

    /// The guest executed HLT.
    Hlt,

    /// The guest shut down (triple fault or explicit request).
    Shutdown,

    /// An exit reason this VMM does not service.
    Unexpected(String),
}

/// Wrapper around the KVM vCPU file descriptor and its mapped run-state.
pub struct Vcpu {
    vcpu: kvm_ioctls::VcpuFd,
}

impl Vcpu {
    pub fn new(vcpu: kvm_ioctls::VcpuFd) -> Self {
        Self { vcpu }
    }

    /// Get the general-purpose register snapshot (rax..r15, rip, rflags).
    pub fn get_regs(&self) -> Result<kvm_regs> {
        self.vcpu
            .get_regs()
            .map_err(|e| VmmError::IoctlFailed("get registers", e))
    }

    /// Set the general-purpose register snapshot.
    pub fn set_regs(&self, regs: &kvm_regs) -> Result<()> {
        self.vcpu
            .set_regs(regs)
            .map_err(|e| VmmError::IoctlFailed("set registers", e))
    }

    /// Get the special register snapshot (segments, descriptor tables,
    /// control registers, EFER, APIC base, pending-interrupt bitmap).
    pub fn get_sregs(&self) -> Result<kvm_sregs> {
        self.vcpu
            .get_sregs()
            .map_err(|e| VmmError::IoctlFailed("get special registers", e))
    }

    /// Set the special register snapshot.
    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<()> {
        self.vcpu
            .set_sregs(sregs)
            .map_err(|e| VmmError::IoctlFailed("set special registers", e))
    }

    /// Install a CPUID table on this vCPU. Must happen before the first
    /// `run`.
    pub fn set_cpuid(&self, cpuid: &CpuId) -> Result<()> {
        self.vcpu
            .set_cpuid2(cpuid)
            .map_err(|e| VmmError::IoctlFailed("set CPUID", e))
    }

    /// Read back the CPUID table installed on this vCPU.
    #[allow(dead_code)]
    pub fn get_cpuid(&self) -> Result<CpuId> {
        self.vcpu
            .get_cpuid2(KVM_MAX_CPUID_ENTRIES)
            .map_err(|e| VmmError::IoctlFailed("get CPUID", e))
    }

    /// Translate a guest virtual address through the guest's current page
    /// tables. Used for diagnostics when the guest stops unexpectedly.
    pub fn translate(&self, gva: u64) -> Result<kvm_translation> {
        self.vcpu
            .translate_gva(gva)
            .map_err(|e| VmmError::IoctlFailed("translate guest address", e))
    }

    /// Run the vCPU until the next VM-exit and service it.
    ///
    /// Port I/O is dispatched to `handler` before this returns, so the
    /// guest's IN data is already in place when it resumes. A `run`
    /// interrupted by a host signal is retried transparently.
    pub fn run_with_io<H: PortIoHandler>(&mut self, handler: &mut H) -> Result<VcpuExit> {
        loop {
            let exit = match self.vcpu.run() {
                Ok(exit) => exit,
                Err(e) if e.errno() == libc::EINTR => continue,
                Err(e) => return Err(VmmError::IoctlFailed("run vCPU", e)),
            };

            return Ok(match exit {
                KvmVcpuExit::IoIn(port, data) => {
                    handler.pio_in(port, data);
                    VcpuExit::Io
                }
                KvmVcpuExit::IoOut(port, data) => {
                    handler.pio_out(port, data);
                    VcpuExit::Io
                }
                KvmVcpuExit::Hlt => VcpuExit::Hlt,
                KvmVcpuExit::Shutdown => VcpuExit::Shutdown,
                other => VcpuExit::Unexpected(format!("{other:?}")),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvm;
    use crate::kvm::Vm;

    fn fresh_vcpu() -> Option<(Vm, Vcpu)> {
        if !kvm::kvm_available() {
            return None;
        }
        let kvm = kvm::open().unwrap();
        let vm = Vm::new(&kvm).unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();
        Some((vm, vcpu))
    }

    #[test]
    fn test_interrupt_bitmap_is_four_words() {
        // 256 pending-interrupt bits packed into u64 words.
        assert_eq!(kvm_sregs::default().interrupt_bitmap.len(), 4);
    }

    #[test]
    fn test_sregs_round_trip() {
        let Some((_vm, vcpu)) = fresh_vcpu() else { return };

        let mut sregs = vcpu.get_sregs().unwrap();
        // Post-reset CR0 carries at least the cache/extension-type bits.
        assert_ne!(sregs.cr0, 0);

        sregs.cr0 = 0xDEAD_BEEF;
        sregs.efer = 0xCAFE_BABE;
        vcpu.set_sregs(&sregs).unwrap();

        let read_back = vcpu.get_sregs().unwrap();
        assert_eq!(read_back.cr0, 0xDEAD_BEEF);
        assert_eq!(read_back.efer, 0xCAFE_BABE);
        assert_eq!(read_back.cr2, 0);
        assert_eq!(read_back.cs.selector, sregs.cs.selector);
        assert_eq!(read_back.gdt.limit, sregs.gdt.limit);
    }
}
