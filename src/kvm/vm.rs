//! Machine-level KVM operations.
//!
//! A VM needs several x86-specific components before its first vCPU can run:
//!
//! - **TSS area**: Intel VT-x requires a guest-physical address for a
//!   three-page task-state area even though hardware task switching is never
//!   used. We place it immediately above guest RAM so the guest cannot
//!   touch it.
//! - **Identity-map page**: one more page, directly after the TSS, used by
//!   KVM when the guest runs in real mode on VT-x.
//! - **IRQ chip**: in-kernel emulation of the interrupt controllers
//!   (I/O APIC for external interrupts plus a local APIC per vCPU).
//! - **PIT**: the in-kernel i8254 timer, which the guest kernel expects
//!   during early boot even when it later switches to other clock sources.
//!
//! Both placement ioctls are only valid while no vCPU exists; the wrapper
//! tracks vCPU creation and turns a mis-ordered call into `NotReady`
//! instead of an opaque ioctl failure.

use super::{Vcpu, PAGE_SIZE};
use crate::error::{Result, VmmError};
use kvm_bindings::{kvm_pit_config, kvm_userspace_memory_region};
use kvm_ioctls::Kvm;
use std::sync::atomic::{AtomicBool, Ordering};

/// Number of pages reserved above guest RAM: three for the TSS, one for the
/// identity map. Guest memory may not grow past `2^32 - 4 * PAGE_SIZE` or
/// the reservation would not fit below the 4 GiB boundary.
const RESERVED_PAGES: u64 = 4;

/// Wrapper around the KVM VM file descriptor.
pub struct Vm {
    vm: kvm_ioctls::VmFd,

    /// Set once the first vCPU has been created. The control-structure
    /// placement ioctls must be rejected after this point.
    vcpu_created: AtomicBool,
}

impl Vm {
    /// Create a new, empty virtual machine.
    pub fn new(kvm: &Kvm) -> Result<Self> {
        let vm = kvm
            .create_vm()
            .map_err(|e| VmmError::IoctlFailed("create VM", e))?;

        Ok(Self {
            vm,
            vcpu_created: AtomicBool::new(false),
        })
    }

    fn check_no_vcpu(&self, what: &'static str) -> Result<()> {
        if self.vcpu_created.load(Ordering::Acquire) {
            return Err(VmmError::NotReady(what));
        }
        Ok(())
    }

    fn check_reservation_fits(mem_size: u64) -> Result<()> {
        if mem_size > (1u64 << 32) - RESERVED_PAGES * PAGE_SIZE {
            return Err(VmmError::GMemNotEnough(
                "TSS and identity map below the 4 GiB boundary",
            ));
        }
        Ok(())
    }

    /// Place the three-page TSS area immediately above guest RAM.
    pub fn place_tss(&self, mem_size: u64) -> Result<()> {
        self.check_no_vcpu("TSS must be placed before any vCPU exists")?;
        Self::check_reservation_fits(mem_size)?;
        self.vm
            .set_tss_address(mem_size as usize)
            .map_err(|e| VmmError::IoctlFailed("set TSS address", e))
    }

    /// Place the identity-map page directly after the TSS area.
    pub fn place_identity_map(&self, mem_size: u64) -> Result<()> {
        self.check_no_vcpu("identity map must be placed before any vCPU exists")?;
        Self::check_reservation_fits(mem_size)?;
        self.vm
            .set_identity_map_address(mem_size + 3 * PAGE_SIZE)
            .map_err(|e| VmmError::IoctlFailed("set identity map address", e))
    }

    /// Create the in-kernel interrupt controller model: an I/O APIC for
    /// external interrupts and a local APIC per vCPU.
    pub fn create_irq_chip(&self) -> Result<()> {
        self.vm
            .create_irq_chip()
            .map_err(|e| VmmError::IoctlFailed("create IRQ chip", e))
    }

    /// Create the in-kernel i8254 PIT with an all-zero configuration.
    pub fn create_pit(&self) -> Result<()> {
        self.vm
            .create_pit2(kvm_pit_config::default())
            .map_err(|e| VmmError::IoctlFailed("create PIT", e))
    }

    /// Register a block of host memory as guest physical memory.
    ///
    /// # Safety
    ///
    /// The host region behind `userspace_addr` must stay mapped and at
    /// least `memory_size` bytes long for the lifetime of the VM.
    pub unsafe fn register_memory(
        &self,
        slot: u32,
        guest_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
    ) -> Result<()> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size,
            userspace_addr,
            flags: 0,
        };

        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(|e| VmmError::IoctlFailed("set user memory region", e))
        }
    }

    /// Create a vCPU. After this call the control-structure placement
    /// ioctls are rejected.
    pub fn create_vcpu(&self, id: u64) -> Result<Vcpu> {
        let vcpu = self
            .vm
            .create_vcpu(id)
            .map_err(|e| VmmError::IoctlFailed("create vCPU", e))?;
        self.vcpu_created.store(true, Ordering::Release);
        Ok(Vcpu::new(vcpu))
    }

    /// Generate one edge-triggered interrupt on `irq` by raising the line
    /// and dropping it again.
    pub fn pulse_irq(&self, irq: u32) -> Result<()> {
        self.vm
            .set_irq_line(irq, true)
            .map_err(|e| VmmError::IoctlFailed("raise IRQ line", e))?;
        self.vm
            .set_irq_line(irq, false)
            .map_err(|e| VmmError::IoctlFailed("lower IRQ line", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvm;

    #[test]
    fn test_reservation_bounds() {
        assert!(Vm::check_reservation_fits((1u64 << 32) - 4 * PAGE_SIZE).is_ok());
        assert!(matches!(
            Vm::check_reservation_fits((1u64 << 32) - 3 * PAGE_SIZE),
            Err(VmmError::GMemNotEnough(_))
        ));
    }

    #[test]
    fn test_placement_after_vcpu_is_rejected() {
        if !kvm::kvm_available() {
            return;
        }
        let kvm = kvm::open().unwrap();
        let vm = Vm::new(&kvm).unwrap();
        let mem_size = 64 * 1024 * 1024;
        vm.place_tss(mem_size).unwrap();
        vm.place_identity_map(mem_size).unwrap();
        vm.create_irq_chip().unwrap();
        vm.create_pit().unwrap();
        let _vcpu = vm.create_vcpu(0).unwrap();
        assert!(matches!(
            vm.place_tss(mem_size),
            Err(VmmError::NotReady(_))
        ));
        assert!(matches!(
            vm.place_identity_map(mem_size),
            Err(VmmError::NotReady(_))
        ));
    }
}
