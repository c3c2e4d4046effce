//! PCI configuration mechanism #1 and the bus-0 device list.
//!
//! The guest reaches PCI through two 4-byte port windows: it writes a
//! packed bus/device/function/register address to CONFIG_ADDRESS (0xCF8)
//! and then moves data through CONFIG_DATA (0xCFC). Both windows are
//! byte-granular - the guest may update a single byte of the address
//! register or read a single byte of a configuration word.
//!
//! Only bus 0, function 0 exists here; the device number indexes the
//! internal list, with the synthetic host bridge at index 0. Addressing
//! anything else behaves like a floating bus: reads return all ones,
//! writes vanish.
//!
//! Accesses inside the 64-byte type-0 header are a straight memcpy against
//! the device's header bytes (which is also how the BAR-size probe
//! protocol works); accesses beyond the header are routed to the device's
//! `configuration_in`/`configuration_out` capability, where the virtio
//! capability chain lives. Ports claimed by a device's I/O BAR are
//! forwarded to the device itself.

mod host_bridge;
mod virtio_net;

pub use host_bridge::HostBridge;
pub use virtio_net::{VirtioNet, VIRTIO_NET_IO_BASE, VIRTIO_NET_IO_SIZE};

use super::PortIoDevice;
use vm_memory::ByteValued;

/// CONFIG_ADDRESS port window (4 bytes).
pub const CONFIG_ADDRESS_PORT: u16 = 0xCF8;

/// CONFIG_DATA port window (4 bytes).
pub const CONFIG_DATA_PORT: u16 = 0xCFC;

/// Size of the type-0 configuration header.
pub const HEADER_SIZE: usize = 64;

/// Offset of BAR0 within the header; BARs occupy `[0x10, 0x28)`.
const BAR0_OFFSET: usize = 0x10;

/// Command register bit: device responds to I/O-space accesses.
pub const COMMAND_IO_SPACE: u16 = 0x0001;

/// Status register bit: a capability list hangs off `capabilities_ptr`.
pub const STATUS_CAPABILITIES_LIST: u16 = 0x0010;

/// The packed CONFIG_ADDRESS register:
/// `{offset:8, function:3, device:5, bus:8, reserved:7, enable:1}`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ConfigAddress(pub u32);

// SAFETY: a bare u32; any bit pattern is valid.
unsafe impl ByteValued for ConfigAddress {}

impl ConfigAddress {
    #[allow(dead_code)]
    pub fn new(enable: bool, bus: u8, device: u8, function: u8, offset: u8) -> Self {
        let mut value = offset as u32;
        value |= (function as u32 & 0x7) << 8;
        value |= (device as u32 & 0x1F) << 11;
        value |= (bus as u32) << 16;
        if enable {
            value |= 1 << 31;
        }
        Self(value)
    }

    pub fn enabled(self) -> bool {
        self.0 & (1 << 31) != 0
    }

    pub fn bus(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn device(self) -> u8 {
        ((self.0 >> 11) & 0x1F) as u8
    }

    pub fn function(self) -> u8 {
        ((self.0 >> 8) & 0x7) as u8
    }

    /// Register offset, aligned down to the 4-byte word the address names.
    pub fn register_offset(self) -> usize {
        (self.0 & 0xFC) as usize
    }
}

/// The 64-byte PCI type-0 configuration header.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct Type0Header {
    pub vendor_id: u16,
    pub device_id: u16,
    pub command: u16,
    pub status: u16,
    pub revision_id: u8,
    pub prog_if: u8,
    pub subclass: u8,
    pub class_code: u8,
    pub cache_line_size: u8,
    pub latency_timer: u8,
    pub header_type: u8,
    pub bist: u8,
    pub bars: [u32; 6],
    pub cardbus_cis_ptr: u32,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub expansion_rom_base: u32,
    pub capabilities_ptr: u8,
    pub _reserved: [u8; 7],
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
    pub min_grant: u8,
    pub max_latency: u8,
}

// SAFETY: plain integers, packed, any bit pattern is valid.
unsafe impl ByteValued for Type0Header {}

/// The capability surface each PCI function exposes to the bus.
///
/// The bus owns its devices; `deinit` runs once on teardown.
pub trait PciDevice: Send {
    /// The port interval `[start, end)` claimed by this device's I/O BAR.
    fn io_range(&self) -> (u16, u16);

    fn header(&self) -> &Type0Header;

    fn header_mut(&mut self) -> &mut Type0Header;

    /// BAR-mapped port read.
    fn pio_in(&mut self, port: u16, data: &mut [u8]);

    /// BAR-mapped port write.
    fn pio_out(&mut self, port: u16, data: &[u8]);

    /// Configuration-space read beyond the type-0 header.
    fn configuration_in(&mut self, offset: usize, data: &mut [u8]);

    /// Configuration-space write beyond the type-0 header. A no-op for
    /// every shipped device; the dispatch is kept so a device with
    /// writable capability state has somewhere to hang it.
    fn configuration_out(&mut self, offset: usize, data: &[u8]);

    fn deinit(&mut self) {}
}

/// Bus 0: the config-address register plus the ordered device list.
pub struct PciBus {
    config_address: ConfigAddress,
    devices: Vec<Box<dyn PciDevice>>,
}

impl PciBus {
    /// Create the bus with the host bridge pre-installed at device 0.
    pub fn new() -> Self {
        Self {
            config_address: ConfigAddress(0),
            devices: vec![Box::new(HostBridge::new())],
        }
    }

    /// Append a device; its index on bus 0 is its position in the list.
    pub fn add_device(&mut self, device: Box<dyn PciDevice>) {
        self.devices.push(device);
    }

    fn selected_device(&mut self) -> Option<&mut Box<dyn PciDevice>> {
        let addr = self.config_address;
        if !addr.enabled() || addr.bus() != 0 || addr.function() != 0 {
            return None;
        }
        self.devices.get_mut(addr.device() as usize)
    }

    fn config_data_read(&mut self, port: u16, data: &mut [u8]) {
        let byte_offset = (port - CONFIG_DATA_PORT) as usize;
        let offset = self.config_address.register_offset() + byte_offset;

        let Some(device) = self.selected_device() else {
            // Floating bus: nothing drives the data lines low.
            data.fill(0xFF);
            return;
        };

        if offset + data.len() <= HEADER_SIZE {
            let bar0 = device.header().bars[0];
            // BAR-size probe: a 32-bit read of BAR0 while it holds the
            // all-ones probe value reports the size of the I/O region.
            if offset == BAR0_OFFSET && data.len() == 4 && bar0 == 0xFFFF_FFFF {
                let (start, end) = device.io_range();
                data.copy_from_slice(&((end - start) as u32).to_le_bytes());
                return;
            }
            data.copy_from_slice(&device.header().as_slice()[offset..offset + data.len()]);
        } else {
            device.configuration_in(offset, data);
        }
    }

    fn config_data_write(&mut self, port: u16, data: &[u8]) {
        let byte_offset = (port - CONFIG_DATA_PORT) as usize;
        let offset = self.config_address.register_offset() + byte_offset;

        let Some(device) = self.selected_device() else {
            return;
        };

        if offset + data.len() <= HEADER_SIZE {
            device.header_mut().as_mut_slice()[offset..offset + data.len()].copy_from_slice(data);
        } else {
            device.configuration_out(offset, data);
        }
    }

    fn bar_device(&mut self, port: u16) -> Option<&mut Box<dyn PciDevice>> {
        self.devices.iter_mut().find(|d| {
            let (start, end) = d.io_range();
            (start..end).contains(&port)
        })
    }
}

impl Default for PciBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PortIoDevice for PciBus {
    fn pio_in(&mut self, port: u16, data: &mut [u8]) {
        match port {
            CONFIG_ADDRESS_PORT..=0xCFB => {
                let byte_offset = (port - CONFIG_ADDRESS_PORT) as usize;
                let bytes = self.config_address.0.to_le_bytes();
                for (i, slot) in data.iter_mut().enumerate() {
                    if let Some(b) = bytes.get(byte_offset + i) {
                        *slot = *b;
                    }
                }
            }
            CONFIG_DATA_PORT..=0xCFF => self.config_data_read(port, data),
            _ => {
                if let Some(device) = self.bar_device(port) {
                    device.pio_in(port, data);
                }
            }
        }
    }

    fn pio_out(&mut self, port: u16, data: &[u8]) {
        match port {
            CONFIG_ADDRESS_PORT..=0xCFB => {
                let byte_offset = (port - CONFIG_ADDRESS_PORT) as usize;
                let mut bytes = self.config_address.0.to_le_bytes();
                for (i, value) in data.iter().enumerate() {
                    if let Some(b) = bytes.get_mut(byte_offset + i) {
                        *b = *value;
                    }
                }
                self.config_address = ConfigAddress(u32::from_le_bytes(bytes));
            }
            CONFIG_DATA_PORT..=0xCFF => self.config_data_write(port, data),
            _ => {
                if let Some(device) = self.bar_device(port) {
                    device.pio_out(port, data);
                }
            }
        }
    }
}

impl Drop for PciBus {
    fn drop(&mut self) {
        for device in &mut self.devices {
            device.deinit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    fn bus_with_virtio_net() -> PciBus {
        let mut bus = PciBus::new();
        bus.add_device(Box::new(VirtioNet::new()));
        bus
    }

    fn select(bus: &mut PciBus, device: u8, offset: u8) {
        let addr = ConfigAddress::new(true, 0, device, 0, offset);
        bus.pio_out(CONFIG_ADDRESS_PORT, &addr.0.to_le_bytes());
    }

    fn read_u32(bus: &mut PciBus) -> u32 {
        let mut data = [0u8; 4];
        bus.pio_in(CONFIG_DATA_PORT, &mut data);
        u32::from_le_bytes(data)
    }

    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<ConfigAddress>(), 4);
        assert_eq!(size_of::<Type0Header>(), HEADER_SIZE);
    }

    #[test]
    fn test_config_address_packing() {
        let addr = ConfigAddress::new(true, 0, 1, 0, 0x10);
        assert_eq!(addr.0, 0x8000_0810);
        assert!(addr.enabled());
        assert_eq!(addr.bus(), 0);
        assert_eq!(addr.device(), 1);
        assert_eq!(addr.function(), 0);
        assert_eq!(addr.register_offset(), 0x10);
    }

    #[test]
    fn test_config_address_accumulates_bytes() {
        let mut bus = PciBus::new();
        let addr = ConfigAddress::new(true, 0, 1, 0, 0x10).0.to_le_bytes();
        // Write the address one byte at a time, then read it back whole.
        for (i, b) in addr.iter().enumerate() {
            bus.pio_out(CONFIG_ADDRESS_PORT + i as u16, &[*b]);
        }
        let mut back = [0u8; 4];
        bus.pio_in(CONFIG_ADDRESS_PORT, &mut back);
        assert_eq!(back, addr);
    }

    #[test]
    fn test_host_bridge_identity() {
        let mut bus = PciBus::new();
        select(&mut bus, 0, 0);
        assert_eq!(read_u32(&mut bus) & 0xFFFF, 0x1AE0);
        // Class word: class 0x06 (bridge), subclass 0x00 (host).
        select(&mut bus, 0, 0x08);
        assert_eq!(read_u32(&mut bus) >> 16, 0x0600);
        // Type-1 bus-number scaffold pre-populated in BAR2.
        select(&mut bus, 0, 0x18);
        assert_eq!(read_u32(&mut bus), 0x00FFFF00);
    }

    #[test]
    fn test_missing_device_reads_all_ones() {
        let mut bus = PciBus::new();
        select(&mut bus, 9, 0);
        assert_eq!(read_u32(&mut bus), 0xFFFF_FFFF);

        // Disabled accesses float too, and writes are dropped.
        let addr = ConfigAddress::new(false, 0, 0, 0, 0);
        bus.pio_out(CONFIG_ADDRESS_PORT, &addr.0.to_le_bytes());
        assert_eq!(read_u32(&mut bus), 0xFFFF_FFFF);
        bus.pio_out(CONFIG_DATA_PORT, &[0u8; 4]);
        select(&mut bus, 0, 0);
        assert_eq!(read_u32(&mut bus) & 0xFFFF, 0x1AE0);
    }

    #[test]
    fn test_bar0_size_probe_round_trip() {
        let mut bus = bus_with_virtio_net();
        select(&mut bus, 1, 0x10);
        assert_eq!(read_u32(&mut bus), 0x1001);

        bus.pio_out(CONFIG_DATA_PORT, &0xFFFF_FFFFu32.to_le_bytes());
        assert_eq!(read_u32(&mut bus), VIRTIO_NET_IO_SIZE as u32);
        // Probing is idempotent until the original value is restored.
        assert_eq!(read_u32(&mut bus), VIRTIO_NET_IO_SIZE as u32);

        bus.pio_out(CONFIG_DATA_PORT, &0x1001u32.to_le_bytes());
        assert_eq!(read_u32(&mut bus), 0x1001);
    }

    #[test]
    fn test_virtio_net_identity_and_capability_chain() {
        let mut bus = bus_with_virtio_net();
        select(&mut bus, 1, 0);
        assert_eq!(read_u32(&mut bus), 0x1041_1AF4);

        // capabilities_ptr points at the first capability.
        select(&mut bus, 1, 0x34);
        assert_eq!(read_u32(&mut bus) & 0xFF, 0x40);

        // Walk the chain: vendor-specific caps typed COMMON, NOTIFY, ISR.
        let mut next = 0x40u8;
        let mut types = Vec::new();
        while next != 0 {
            select(&mut bus, 1, next);
            let word = read_u32(&mut bus);
            assert_eq!(word & 0xFF, 0x09, "cap_vndr must be vendor-specific");
            types.push((word >> 24) as u8);
            next = (word >> 8) as u8;
        }
        assert_eq!(types, vec![1, 2, 3]);
    }

    #[test]
    fn test_bar_mapped_pio_routes_to_device() {
        let mut bus = bus_with_virtio_net();
        // num_queues lives at offset 18 of the common config: one queue.
        let mut data = [0u8; 2];
        bus.pio_in(VIRTIO_NET_IO_BASE + 18, &mut data);
        assert_eq!(u16::from_le_bytes(data), 1);

        // Writes into BAR0 are accepted and discarded.
        bus.pio_out(VIRTIO_NET_IO_BASE + 18, &[0xFF, 0xFF]);
        bus.pio_in(VIRTIO_NET_IO_BASE + 18, &mut data);
        assert_eq!(u16::from_le_bytes(data), 1);
    }
}
