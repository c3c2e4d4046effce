//! PIO device registry.
//!
//! An ordered list of port intervals, each owning a device handle. Routing
//! scans in insertion order and dispatches to the first interval containing
//! the port, so registration order doubles as dispatch priority: specific
//! devices (COM1, PS/2) are registered before the PCI catch-all that spans
//! the whole port space.
//!
//! Ports no interval claims are ignored entirely. The guest probes legacy
//! port space speculatively during boot; a bus with no responder neither
//! answers nor faults, and neither do we.

use std::sync::{Arc, Mutex};

/// A device reachable through port I/O.
pub trait PortIoDevice: Send {
    /// Guest IN from `port`: fill `data` (1, 2, or 4 bytes).
    fn pio_in(&mut self, port: u16, data: &mut [u8]);

    /// Guest OUT to `port`: consume `data`.
    fn pio_out(&mut self, port: u16, data: &[u8]);
}

/// Shared handle to a registered device. The mutex is what lets the UART
/// be driven by both the vCPU thread (register access) and the TTY input
/// thread (RX injection).
pub type PioDeviceHandle = Arc<Mutex<dyn PortIoDevice>>;

struct PioRange {
    /// Inclusive port interval claimed by the device.
    start: u16,
    end: u16,
    device: PioDeviceHandle,
}

/// Insertion-ordered PIO router.
#[derive(Default)]
pub struct PioBus {
    ranges: Vec<PioRange>,
}

impl PioBus {
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Register `device` for the inclusive interval `[start, end]`.
    /// Overlapping intervals are allowed; earlier registrations win.
    pub fn add(&mut self, start: u16, end: u16, device: PioDeviceHandle) {
        self.ranges.push(PioRange { start, end, device });
    }

    fn find(&self, port: u16) -> Option<&PioRange> {
        self.ranges
            .iter()
            .find(|r| (r.start..=r.end).contains(&port))
    }

    /// Route a guest IN. Unclaimed ports are a no-op and `data` is left
    /// untouched.
    pub fn pio_in(&self, port: u16, data: &mut [u8]) {
        if let Some(range) = self.find(port) {
            range.device.lock().unwrap().pio_in(port, data);
        }
    }

    /// Route a guest OUT. Unclaimed ports are a no-op.
    pub fn pio_out(&self, port: u16, data: &[u8]) {
        if let Some(range) = self.find(port) {
            range.device.lock().unwrap().pio_out(port, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        value: u8,
        writes: Vec<(u16, u8)>,
    }

    impl PortIoDevice for Recorder {
        fn pio_in(&mut self, _port: u16, data: &mut [u8]) {
            data[0] = self.value;
        }

        fn pio_out(&mut self, port: u16, data: &[u8]) {
            self.writes.push((port, data[0]));
        }
    }

    fn recorder(value: u8) -> Arc<Mutex<Recorder>> {
        Arc::new(Mutex::new(Recorder {
            value,
            writes: Vec::new(),
        }))
    }

    #[test]
    fn test_first_match_wins() {
        let specific = recorder(0x11);
        let catch_all = recorder(0x22);

        let mut bus = PioBus::new();
        bus.add(0x3F8, 0x3FF, specific.clone());
        bus.add(0x0000, 0xFFFF, catch_all.clone());

        let mut data = [0u8];
        bus.pio_in(0x3F8, &mut data);
        assert_eq!(data[0], 0x11);

        bus.pio_in(0x1234, &mut data);
        assert_eq!(data[0], 0x22);
    }

    #[test]
    fn test_unclaimed_port_is_a_no_op() {
        let dev = recorder(0x11);
        let mut bus = PioBus::new();
        bus.add(0x60, 0x64, dev.clone());

        let mut data = [0xABu8];
        bus.pio_in(0x70, &mut data);
        assert_eq!(data[0], 0xAB, "IN on an unclaimed port must not touch data");

        bus.pio_out(0x70, &[0xCD]);
        assert!(dev.lock().unwrap().writes.is_empty());
    }

    #[test]
    fn test_interval_bounds_are_inclusive() {
        let dev = recorder(0x33);
        let mut bus = PioBus::new();
        bus.add(0x60, 0x64, dev.clone());

        bus.pio_out(0x60, &[1]);
        bus.pio_out(0x64, &[2]);
        bus.pio_out(0x65, &[3]);
        assert_eq!(dev.lock().unwrap().writes, vec![(0x60, 1), (0x64, 2)]);
    }
}
