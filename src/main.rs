//! tinyvmm - a minimal KVM-based virtual machine monitor.
//!
//! Boots an unmodified Linux kernel (bzImage plus optional initrd) with one
//! vCPU, a flat block of guest memory, and a handful of emulated legacy
//! PIO devices. Linux-only: everything rests on /dev/kvm.

mod boot;
mod devices;
mod error;
mod kvm;
mod tty;
mod vmm;

use clap::Parser;
use error::{Result, VmmError};
use std::path::PathBuf;
use std::process::ExitCode;
use vmm::{Vmm, VmmConfig, DEFAULT_CMDLINE};

/// Exit codes promised to callers.
const EXIT_MEMORY_PARSE: u8 = 1;
const EXIT_FILE_OPEN: u8 = 9;
const EXIT_UNEXPECTED_VMEXIT: u8 = 99;
const EXIT_OTHER: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "tinyvmm")]
#[command(about = "A minimal KVM-based VMM for booting Linux guests")]
struct Args {
    /// Path to the Linux kernel bzImage
    #[arg(long)]
    kernel: PathBuf,

    /// Path to an initrd image
    #[arg(long)]
    initrd: Option<PathBuf>,

    /// Guest memory size, e.g. "512M", "2G", "1GB"
    #[arg(long, default_value = "1G")]
    memory: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let memory_bytes = match parse_memory_size(&args.memory) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(EXIT_MEMORY_PARSE);
        }
    };

    let kernel = match std::fs::read(&args.kernel) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Error: cannot read kernel {}: {e}", args.kernel.display());
            return ExitCode::from(EXIT_FILE_OPEN);
        }
    };

    let initrd = match &args.initrd {
        Some(path) => match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("Error: cannot read initrd {}: {e}", path.display());
                return ExitCode::from(EXIT_FILE_OPEN);
            }
        },
        None => Vec::new(),
    };

    eprintln!("[VMM] kernel: {}", args.kernel.display());
    eprintln!("[VMM] memory: {} MiB", memory_bytes >> 20);

    match run(memory_bytes, &kernel, &initrd) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            match e {
                VmmError::UnexpectedExit(_) => ExitCode::from(EXIT_UNEXPECTED_VMEXIT),
                VmmError::InvalidMemoryUnit(_) => ExitCode::from(EXIT_MEMORY_PARSE),
                _ => ExitCode::from(EXIT_OTHER),
            }
        }
    }
}

fn run(memory_bytes: u64, kernel: &[u8], initrd: &[u8]) -> Result<()> {
    let mut vmm = Vmm::new(&VmmConfig { memory_bytes })?;
    vmm.load(kernel, initrd, DEFAULT_CMDLINE)?;

    // Raw mode is best effort: without a controlling terminal the guest
    // simply gets no keyboard input. The guard restores the terminal on
    // every return path below.
    let _raw_tty = match tty::RawTty::open() {
        Ok(raw) => {
            if let Err(e) = raw.spawn_input_pump(vmm.serial()) {
                eprintln!("[VMM] cannot start tty input pump: {e}");
            }
            Some(raw)
        }
        Err(e) => {
            eprintln!("[VMM] no usable terminal, running headless: {e}");
            None
        }
    };

    vmm.run()
}

/// Parse a memory size string: a number followed by a `K`/`M`/`G` unit in
/// either case, an optional trailing `B`/`b`, and optional surrounding
/// whitespace. `"32GB"`, `"10kb"`, and `"  1m"` are all accepted.
fn parse_memory_size(input: &str) -> Result<u64> {
    let err = || VmmError::InvalidMemoryUnit(input.to_string());

    let trimmed = input.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(digits_end);

    let value: u64 = digits.parse().map_err(|_| err())?;
    let unit = unit.strip_suffix(['B', 'b']).unwrap_or(unit);
    let shift = match unit {
        "K" | "k" => 10,
        "M" | "m" => 20,
        "G" | "g" => 30,
        _ => return Err(err()),
    };

    value.checked_shl(shift).filter(|v| v >> shift == value).ok_or_else(err)
}
