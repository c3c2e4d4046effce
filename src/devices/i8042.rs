//! i8042 PS/2 controller mock.
//!
//! Enough of the keyboard controller to satisfy the guest kernel's probing:
//! a status register on 0x64, a data register on 0x60, and the one command
//! the probe sequence actually depends on (0x20, "read configuration
//! byte"). Everything else on the command port is logged and ignored
//! rather than modeled - the probe traffic varies by guest kernel version
//! and none of it needs an answer beyond the status register.

use super::{PortIoDevice, I8042_COMMAND_PORT, I8042_DATA_PORT};

/// Status register: output buffer full.
const STATUS_OUTPUT_FULL: u8 = 0x01;

/// Configuration byte: "system flag" (self-test passed).
const CONFIG_SYSTEM_FLAG: u8 = 0x04;

/// Command 0x20: load the configuration byte into the data register.
const CMD_READ_CONFIG: u8 = 0x20;

/// Minimal i8042 state: status, configuration byte, one data byte.
pub struct I8042 {
    status: u8,
    config: u8,
    data: u8,
}

impl I8042 {
    pub fn new() -> Self {
        Self {
            status: STATUS_OUTPUT_FULL,
            config: CONFIG_SYSTEM_FLAG,
            data: 0,
        }
    }
}

impl Default for I8042 {
    fn default() -> Self {
        Self::new()
    }
}

impl PortIoDevice for I8042 {
    fn pio_in(&mut self, port: u16, data: &mut [u8]) {
        data[0] = match port {
            I8042_DATA_PORT => self.data,
            I8042_COMMAND_PORT => self.status,
            _ => return,
        };
    }

    fn pio_out(&mut self, port: u16, data: &[u8]) {
        match port {
            I8042_DATA_PORT => self.data = data[0],
            I8042_COMMAND_PORT => match data[0] {
                CMD_READ_CONFIG => self.data = self.config,
                other => {
                    eprintln!("[I/O] i8042: ignoring command {other:#04x}");
                }
            },
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_reports_output_full() {
        let mut dev = I8042::new();
        let mut data = [0u8];
        dev.pio_in(I8042_COMMAND_PORT, &mut data);
        assert_eq!(data[0], STATUS_OUTPUT_FULL);
    }

    #[test]
    fn test_read_config_command() {
        let mut dev = I8042::new();
        dev.pio_out(I8042_COMMAND_PORT, &[CMD_READ_CONFIG]);
        let mut data = [0u8];
        dev.pio_in(I8042_DATA_PORT, &mut data);
        assert_eq!(data[0], CONFIG_SYSTEM_FLAG);
    }

    #[test]
    fn test_data_write_overwrites_data_byte() {
        let mut dev = I8042::new();
        dev.pio_out(I8042_DATA_PORT, &[0x5A]);
        let mut data = [0u8];
        dev.pio_in(I8042_DATA_PORT, &mut data);
        assert_eq!(data[0], 0x5A);
    }

    #[test]
    fn test_unknown_command_is_ignored() {
        let mut dev = I8042::new();
        dev.pio_out(I8042_COMMAND_PORT, &[0xAA]);
        let mut data = [0u8];
        dev.pio_in(I8042_DATA_PORT, &mut data);
        assert_eq!(data[0], 0, "unknown commands must not disturb state");
    }
}
