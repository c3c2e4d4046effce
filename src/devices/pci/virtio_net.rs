//! virtio-net modern (non-transitional) discovery stub.
//!
//! Advertises a virtio 1.x network function completely enough for a guest
//! driver to find it and map its configuration structures, without
//! processing any virtqueues: the capability chain in configuration space
//! points COMMON_CFG, NOTIFY_CFG, and ISR_CFG into the I/O BAR, and reads
//! of the BAR's common-config window serve a static
//! `VirtioPciCommonConfig` that claims a single, never-enabled queue.
//! Writes into the BAR are accepted and discarded.
//!
//! Reference: virtio 1.1 §4.1 ("Virtio Over PCI Bus")

use super::{PciDevice, Type0Header, COMMAND_IO_SPACE, STATUS_CAPABILITIES_LIST};
use std::mem::size_of;
use vm_memory::ByteValued;

/// Guest I/O port window claimed by BAR0.
pub const VIRTIO_NET_IO_BASE: u16 = 0x1000;
pub const VIRTIO_NET_IO_SIZE: u16 = 0x100;

/// Virtio PCI vendor and the modern (0x1040 + type) net device ID.
const VIRTIO_VENDOR_ID: u16 = 0x1AF4;
const VIRTIO_NET_MODERN_DEVICE_ID: u16 = 0x1041;

/// PCI class 0x02 / subclass 0x00: Ethernet controller.
const CLASS_NETWORK: u8 = 0x02;
const SUBCLASS_ETHERNET: u8 = 0x00;

/// Vendor-specific capability ID carried by every virtio capability.
const CAP_ID_VENDOR: u8 = 0x09;

/// Virtio capability configuration types.
const CFG_TYPE_COMMON: u8 = 1;
const CFG_TYPE_NOTIFY: u8 = 2;
const CFG_TYPE_ISR: u8 = 3;

/// Configuration-space offset of the first capability (right after the
/// type-0 header).
const CAP_CHAIN_START: u8 = 0x40;

/// A virtio PCI capability descriptor, chained through `cap_next`.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct VirtioPciCap {
    pub cap_vndr: u8,
    pub cap_next: u8,
    pub cap_len: u8,
    pub cfg_type: u8,
    pub bar: u8,
    pub id: u8,
    pub padding: [u8; 2],
    pub offset: u32,
    pub length: u32,
}

// SAFETY: plain integers, packed, any bit pattern is valid.
unsafe impl ByteValued for VirtioPciCap {}

/// The common configuration structure readable at the start of BAR0.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct VirtioPciCommonConfig {
    pub device_features_sel: u32,
    pub device_features: u32,
    pub driver_features_sel: u32,
    pub driver_features: u32,
    pub msix_config: u16,
    pub num_queues: u16,
    pub device_status: u8,
    pub config_generation: u8,
    pub queue_select: u16,
    pub queue_size: u16,
    pub queue_msix_vector: u16,
    pub queue_enable: u16,
    pub queue_notify_off: u16,
    pub queue_desc: u64,
    pub queue_avail: u64,
    pub queue_used: u64,
}

// SAFETY: plain integers, packed, any bit pattern is valid.
unsafe impl ByteValued for VirtioPciCommonConfig {}

pub struct VirtioNet {
    header: Type0Header,
    caps: [VirtioPciCap; 3],
    common_config: VirtioPciCommonConfig,
}

impl VirtioNet {
    pub fn new() -> Self {
        let mut header = Type0Header {
            vendor_id: VIRTIO_VENDOR_ID,
            device_id: VIRTIO_NET_MODERN_DEVICE_ID,
            command: COMMAND_IO_SPACE,
            status: STATUS_CAPABILITIES_LIST,
            // Non-transitional devices must report revision >= 1.
            revision_id: 1,
            subclass: SUBCLASS_ETHERNET,
            class_code: CLASS_NETWORK,
            capabilities_ptr: CAP_CHAIN_START,
            interrupt_pin: 1,
            ..Default::default()
        };
        header.bars[0] = VIRTIO_NET_IO_BASE as u32 | 0x1; // I/O-space BAR

        let cap_size = size_of::<VirtioPciCap>() as u8;
        let common_size = size_of::<VirtioPciCommonConfig>() as u32;
        let cap = |cap_next: u8, cfg_type: u8, offset: u32, length: u32| VirtioPciCap {
            cap_vndr: CAP_ID_VENDOR,
            cap_next,
            cap_len: cap_size,
            cfg_type,
            bar: 0,
            offset,
            length,
            ..Default::default()
        };

        let caps = [
            cap(CAP_CHAIN_START + cap_size, CFG_TYPE_COMMON, 0, common_size),
            cap(CAP_CHAIN_START + 2 * cap_size, CFG_TYPE_NOTIFY, common_size, 4),
            cap(0, CFG_TYPE_ISR, common_size, 1),
        ];

        let common_config = VirtioPciCommonConfig {
            num_queues: 1,
            ..Default::default()
        };

        Self {
            header,
            caps,
            common_config,
        }
    }
}

impl Default for VirtioNet {
    fn default() -> Self {
        Self::new()
    }
}

impl PciDevice for VirtioNet {
    fn io_range(&self) -> (u16, u16) {
        (VIRTIO_NET_IO_BASE, VIRTIO_NET_IO_BASE + VIRTIO_NET_IO_SIZE)
    }

    fn header(&self) -> &Type0Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Type0Header {
        &mut self.header
    }

    fn pio_in(&mut self, port: u16, data: &mut [u8]) {
        let offset = (port - VIRTIO_NET_IO_BASE) as usize;
        let window = self.common_config.as_slice();
        if offset + data.len() <= window.len() {
            data.copy_from_slice(&window[offset..offset + data.len()]);
        }
        // Reads beyond the common-config window return without effect.
    }

    fn pio_out(&mut self, _port: u16, _data: &[u8]) {
        // No virtqueue processing yet; driver writes are discarded.
    }

    fn configuration_in(&mut self, offset: usize, data: &mut [u8]) {
        let chain_start = CAP_CHAIN_START as usize;
        let cap_size = size_of::<VirtioPciCap>();
        let chain_end = chain_start + self.caps.len() * cap_size;

        for (i, slot) in data.iter_mut().enumerate() {
            let at = offset + i;
            *slot = if (chain_start..chain_end).contains(&at) {
                let rel = at - chain_start;
                self.caps[rel / cap_size].as_slice()[rel % cap_size]
            } else {
                0
            };
        }
    }

    fn configuration_out(&mut self, _offset: usize, _data: &[u8]) {
        // Capability state is immutable in this stub.
    }
}
