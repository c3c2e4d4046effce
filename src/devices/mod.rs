//! Emulated legacy PIO devices.
//!
//! Everything the guest can observe from this VMM is port-mapped I/O: the
//! COM1 UART, the i8042 PS/2 controller, and PCI configuration mechanism #1
//! with its BAR-mapped windows. The [`bus::PioBus`] routes each IN/OUT exit
//! to the first registered device whose port interval matches.

pub mod bus;
pub mod i8042;
pub mod pci;
pub mod serial;

pub use bus::{PioBus, PortIoDevice};
pub use i8042::I8042;
pub use serial::Serial;

use crate::error::Result;

/// I/O port range for the COM1 serial port.
pub const SERIAL_COM1_BASE: u16 = 0x3F8;
pub const SERIAL_COM1_END: u16 = 0x3FF;

/// I/O ports of the i8042 controller (data and status/command).
pub const I8042_DATA_PORT: u16 = 0x60;
pub const I8042_COMMAND_PORT: u16 = 0x64;

/// A guest interrupt line that can deliver one edge.
///
/// The UART raises its interrupt through this seam; the production
/// implementation pulses a KVM IRQ line, tests count calls.
pub trait IrqLine: Send {
    fn pulse(&self) -> Result<()>;
}
