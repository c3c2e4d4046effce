//! Linux boot: guest memory, bzImage parsing, and the 32-bit boot protocol.
//!
//! This VMM uses the protected-mode entry of the Linux boot protocol: the
//! protected-mode kernel is copied to the 1 MiB mark and entered directly
//! at its first byte with the CPU already in flat 32-bit protected mode,
//! ESI pointing at the zero page. The kernel enables paging and long mode
//! itself, so no page tables are built here.
//!
//! # Guest physical layout
//!
//! ```text
//! 0x0001_0000 - 0x0001_1000  boot_params (zero page)
//! 0x0002_0000 - ...          kernel command line
//! 0x0010_0000 - kernel_end   protected-mode kernel code
//! 0x3000_0000 - ...          initrd (when given)
//! mem_size    - +0x3000      TSS (three pages, outside guest RAM)
//! mem_size+0x3000 - +0x4000  identity-map page (outside guest RAM)
//! ```

mod bzimage;
mod memory;
mod params;

pub use bzimage::{parse, BzImage};
pub use memory::GuestMemory;
pub use params::{
    BootE820Entry, BootParams, SetupHeader, BOOT_PARAMS_SIZE, CAN_USE_HEAP, E820_RAM,
    KEEP_SEGMENTS, LOADED_HIGH, SETUP_HEADER_OFFSET, SETUP_MAGIC,
};

use crate::error::{Result, VmmError};
use vm_memory::ByteValued;

/// Guest physical memory layout constants.
pub mod layout {
    /// Where the populated boot_params page is written.
    pub const BOOT_PARAMS_START: u64 = 0x0001_0000;

    /// Where the kernel command line is written.
    pub const CMDLINE_START: u64 = 0x0002_0000;

    /// Load address of the protected-mode kernel (the 1 MiB mark), which
    /// is also the 32-bit entry point.
    pub const KERNEL_START: u64 = 0x0010_0000;

    /// Load address of the initrd.
    pub const INITRD_START: u64 = 0x3000_0000;

    /// Smallest guest memory this loader accepts. The layout above (in
    /// particular the fixed initrd address) assumes at least this much.
    pub const MIN_GUEST_MEMORY: u64 = 1 << 30;
}

/// Identity of this loader in `type_of_loader`: undefined bootloader.
const TYPE_OF_LOADER_UNDEFINED: u8 = 0xFF;

/// `vid_mode` value for "normal".
const VID_MODE_NORMAL: u16 = 0xFFFF;

/// Stage the kernel, initrd, command line, and zero page in guest memory.
///
/// On success the guest is ready to be entered at
/// [`layout::KERNEL_START`] with RSI = [`layout::BOOT_PARAMS_START`].
pub fn load(memory: &GuestMemory, kernel: &[u8], initrd: &[u8], cmdline: &str) -> Result<()> {
    let mem_size = memory.size();
    if mem_size < layout::MIN_GUEST_MEMORY {
        return Err(VmmError::GMemNotEnough("the boot layout (need 1 GiB)"));
    }

    let image = bzimage::parse(kernel)?;
    if image.kernel_code.len() as u64 > mem_size - layout::KERNEL_START {
        return Err(VmmError::GMemNotEnough("the protected-mode kernel"));
    }

    let mut boot_params = image.boot_params;
    boot_params.hdr.type_of_loader = TYPE_OF_LOADER_UNDEFINED;
    boot_params.hdr.ext_loader_ver = 0;
    boot_params.hdr.loadflags |= LOADED_HIGH | CAN_USE_HEAP | KEEP_SEGMENTS;
    boot_params.hdr.heap_end_ptr = (layout::BOOT_PARAMS_START - 0x200) as u16;
    boot_params.hdr.cmd_line_ptr = layout::CMDLINE_START as u32;
    boot_params.hdr.vid_mode = VID_MODE_NORMAL;

    boot_params.add_e820_ram(0, layout::KERNEL_START);
    boot_params.add_e820_ram(layout::KERNEL_START, mem_size - layout::KERNEL_START);

    if initrd.is_empty() {
        boot_params.hdr.ramdisk_image = 0;
        boot_params.hdr.ramdisk_size = 0;
    } else {
        let initrd_end = layout::INITRD_START + initrd.len() as u64;
        let initrd_addr_max = u64::from(boot_params.hdr.initrd_addr_max);
        if initrd_end > mem_size {
            return Err(VmmError::GMemNotEnough("the initrd"));
        }
        if initrd_end > initrd_addr_max {
            return Err(VmmError::GMemNotEnough(
                "the initrd below the kernel's initrd_addr_max",
            ));
        }
        memory.write(layout::INITRD_START, initrd)?;
        boot_params.hdr.ramdisk_image = layout::INITRD_START as u32;
        boot_params.hdr.ramdisk_size = initrd.len() as u32;
        eprintln!(
            "[Boot] initrd: {} bytes at {:#x}",
            initrd.len(),
            layout::INITRD_START
        );
    }

    // The command line slot is as large as the kernel says it accepts;
    // zero-pad so stale bytes from a previous layout never leak in.
    let cmdline_capacity = boot_params.hdr.cmdline_size as usize;
    let mut padded = vec![0u8; cmdline_capacity.max(cmdline.len() + 1)];
    padded[..cmdline.len()].copy_from_slice(cmdline.as_bytes());
    memory.write(layout::CMDLINE_START, &padded)?;

    memory.write(layout::BOOT_PARAMS_START, boot_params.as_slice())?;
    memory.write(layout::KERNEL_START, image.kernel_code)?;

    eprintln!(
        "[Boot] kernel at {:#x}, boot_params at {:#x}, cmdline {cmdline:?}",
        layout::KERNEL_START,
        layout::BOOT_PARAMS_START
    );

    Ok(())
}

/// A minimal loadable bzImage for tests elsewhere in the crate.
#[cfg(test)]
pub(crate) fn test_bzimage() -> Vec<u8> {
    bzimage::tests::synthetic_bzimage(4, &[0xF4; 2048])
}
