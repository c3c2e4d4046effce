//! CPUID shaping for the guest.
//!
//! The table KVM reports as "supported" is close to what the guest should
//! see, but three entries need rewriting before it is installed:
//!
//! - the KVM signature leaf, so the guest's paravirt probing finds
//!   "KVMKVMKVM" where it expects it,
//! - the hypervisor-present bit in the feature-information leaf,
//! - the FSRM feature bit, which must be cleared (see below).

use crate::error::{Result, VmmError};
use kvm_bindings::{CpuId, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::Kvm;

/// Hypervisor vendor signature leaf.
pub const KVM_CPUID_SIGNATURE: u32 = 0x4000_0000;

/// Leaf 1: feature information. ECX bit 31 tells the guest it runs under a
/// hypervisor.
const FEATURE_INFORMATION: u32 = 0x0000_0001;
const ECX_HYPERVISOR: u32 = 1 << 31;

/// Leaf 7: structured extended feature flags. EDX bit 4 is
/// X86_FEATURE_FSRM ("fast short rep movsb").
const EXTENDED_FEATURE_FLAGS: u32 = 0x0000_0007;
const EDX_FSRM: u32 = 1 << 4;

/// Query the subsystem handle for the host-supported CPUID table.
pub fn supported_cpuid(kvm: &Kvm) -> Result<CpuId> {
    kvm.get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
        .map_err(|e| VmmError::IoctlFailed("get supported CPUID", e))
}

/// Rewrite the supported-CPUID table in place for this guest.
///
/// The signature leaf is overwritten with max-leaf 0x40000001 and the
/// "KVMKVMKVM" vendor bytes; if KVM did not report that leaf at all the
/// table is unusable and the call fails `NotReady`.
///
/// FSRM is force-cleared: with it visible, the guest kernel patches the
/// `memmove` prologue for rep-movsb while executing inside it, which has
/// been observed to corrupt the vCPU. Keep this workaround even if the
/// host CPU advertises the feature.
pub fn shape_cpuid(cpuid: &mut CpuId) -> Result<()> {
    let mut signature_seen = false;

    for entry in cpuid.as_mut_slice() {
        match entry.function {
            KVM_CPUID_SIGNATURE => {
                entry.eax = 0x4000_0001;
                entry.ebx = 0x4B4D_564B; // "KVMK"
                entry.ecx = 0x564B_4D56; // "VMKV"
                entry.edx = 0x0000_004D; // "M"
                signature_seen = true;
            }
            FEATURE_INFORMATION => {
                entry.ecx |= ECX_HYPERVISOR;
            }
            EXTENDED_FEATURE_FLAGS => {
                entry.edx &= !EDX_FSRM;
            }
            _ => {}
        }
    }

    if !signature_seen {
        return Err(VmmError::NotReady(
            "supported CPUID has no KVM signature leaf",
        ));
    }
    Ok(())
}
