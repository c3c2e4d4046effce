//! Linux bzImage parsing.
//!
//! A bzImage is three parts laid end to end: a legacy boot sector, the
//! real-mode setup code (`setup_sects` 512-byte sectors, carrying the setup
//! header at offset 0x1F1), and the protected-mode kernel proper. Only the
//! header and the protected-mode code matter for direct boot; the boot
//! sector and setup code never execute.
//!
//! ```text
//! +------------------+ 0x0000
//! |   Boot sector    | 512 bytes
//! +------------------+ 0x0200
//! |   Setup code     | setup_sects x 512 bytes (header at 0x1F1)
//! +------------------+ (setup_sects + 1) * 512
//! | Protected-mode   | loaded at the 1 MiB mark
//! |     kernel       |
//! +------------------+
//! ```
//!
//! Reference: <https://www.kernel.org/doc/html/latest/arch/x86/boot.html>

use super::params::{BootParams, BOOT_PARAMS_SIZE, SETUP_MAGIC};
use crate::error::{Result, VmmError};
use vm_memory::ByteValued;

/// Minimum boot protocol version this loader understands. 2.06 introduced
/// the extended loader-version fields the load contract writes.
const MIN_BOOT_VERSION: u16 = 0x0206;

/// A parsed bzImage: the zero-page prototype decoded from its first page
/// and the protected-mode code to be placed at the 1 MiB mark.
pub struct BzImage<'a> {
    /// Zero page seeded from the image's first 0x1000 bytes; the load path
    /// mutates the loader-owned fields before writing it to guest memory.
    pub boot_params: BootParams,

    /// Kernel code from offset `(setup_sects + 1) * 512` to end of image.
    pub kernel_code: &'a [u8],
}

/// Parse and validate a bzImage.
pub fn parse(kernel: &[u8]) -> Result<BzImage<'_>> {
    if kernel.len() < BOOT_PARAMS_SIZE {
        return Err(VmmError::InvalidKernel(format!(
            "image is {} bytes, smaller than one setup page",
            kernel.len()
        )));
    }

    let boot_params = BootParams::from_slice(&kernel[..BOOT_PARAMS_SIZE])
        .copied()
        .expect("slice length was just checked");
    let hdr = boot_params.hdr;

    let magic = hdr.header;
    if magic != SETUP_MAGIC {
        return Err(VmmError::InvalidKernel(format!(
            "setup magic is {magic:#x}, expected {SETUP_MAGIC:#x} (HdrS)"
        )));
    }
    let version = hdr.version;
    if version < MIN_BOOT_VERSION {
        return Err(VmmError::InvalidKernel(format!(
            "boot protocol version {version:#06x} is older than {MIN_BOOT_VERSION:#06x}"
        )));
    }

    // Very old kernels wrote 0 here to mean 4 sectors.
    let setup_sects = match hdr.setup_sects {
        0 => 4,
        n => n as usize,
    };
    let setup_size = (setup_sects + 1) * 512;
    if setup_size >= kernel.len() {
        return Err(VmmError::InvalidKernel(format!(
            "setup area ({setup_size} bytes) exceeds image ({} bytes)",
            kernel.len()
        )));
    }

    eprintln!(
        "[Boot] bzImage: protocol {version:#06x}, {setup_sects} setup sectors, {} bytes of kernel code",
        kernel.len() - setup_size
    );

    Ok(BzImage {
        boot_params,
        kernel_code: &kernel[setup_size..],
    })
}
