//! Raw-mode terminal handling and the guest input pump.
//!
//! The host terminal is switched to a character-at-a-time mode so key
//! presses reach the guest UART immediately: echo, canonical buffering,
//! flow control, and CR/NL translation all go away, with `VMIN = 0` /
//! `VTIME = 0` making reads non-blocking. ISIG is deliberately left
//! enabled so Ctrl-C and Ctrl-Z still act on the VMM process itself -
//! that is the only way to kill a hung guest.
//!
//! [`RawTty`] is an RAII guard: the original termios is captured on open
//! and restored on drop, which covers every exit path except a fatal
//! signal (no restore runs then; the shell's `reset` is the escape hatch).

use crate::devices::Serial;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Largest chunk pulled from the terminal per read.
const READ_CHUNK: usize = 256;

/// Pause between bytes fed to the UART, and the retry interval while its
/// single-byte RX slot is still full.
const FEED_INTERVAL: Duration = Duration::from_millis(1);

/// Idle sleep when the terminal has nothing for us (reads are
/// non-blocking).
const IDLE_INTERVAL: Duration = Duration::from_millis(10);

/// The controlling terminal, switched to raw mode until dropped.
pub struct RawTty {
    tty: File,
    saved: libc::termios,
}

impl RawTty {
    /// Open `/dev/tty` and enter raw mode.
    pub fn open() -> io::Result<Self> {
        let tty = OpenOptions::new().read(true).write(true).open("/dev/tty")?;
        let fd = tty.as_raw_fd();

        let mut saved: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut saved) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut raw = saved;
        raw.c_lflag &= !(libc::ECHO | libc::ICANON | libc::IEXTEN);
        raw.c_iflag &= !(libc::IXON | libc::ICRNL | libc::BRKINT | libc::INPCK | libc::ISTRIP);
        raw.c_cflag |= libc::CS8;
        raw.c_cc[libc::VMIN] = 0;
        raw.c_cc[libc::VTIME] = 0;
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { tty, saved })
    }

    /// Start the background thread that feeds terminal bytes into the
    /// UART's RX slot. The thread is detached; it spends its life in
    /// non-blocking reads and sleeps, and dies with the process.
    pub fn spawn_input_pump(&self, serial: Arc<Mutex<Serial>>) -> io::Result<()> {
        let reader = self.tty.try_clone()?;
        thread::Builder::new()
            .name("tty-input".into())
            .spawn(move || input_pump(reader, serial))?;
        Ok(())
    }
}

impl Drop for RawTty {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(self.tty.as_raw_fd(), libc::TCSANOW, &self.saved);
        }
    }
}

fn input_pump(mut tty: File, serial: Arc<Mutex<Serial>>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match tty.read(&mut buf) {
            Ok(0) => thread::sleep(IDLE_INTERVAL),
            Ok(n) => {
                for &byte in &buf[..n] {
                    // The slot holds one byte; retry until the guest has
                    // drained the previous one.
                    while serial.lock().unwrap().input(byte) == 0 {
                        thread::sleep(FEED_INTERVAL);
                    }
                    thread::sleep(FEED_INTERVAL);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                eprintln!("[VMM] tty input pump stopped: {e}");
                return;
            }
        }
    }
}
