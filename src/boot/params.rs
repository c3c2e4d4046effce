//! Linux boot_params (zero page) structures.
//!
//! The `boot_params` page is the 4 KiB communication block the loader hands
//! to the kernel. Its layout is fixed by the x86 boot protocol; the fields
//! this VMM cares about:
//!
//! - `e820_entries` (0x1E8) and `e820_table` (0x2D0): the memory map
//! - `hdr` (0x1F1): the setup header copied out of the bzImage, into which
//!   the loader writes its identity, the command-line pointer, the ramdisk
//!   location, and the load flags
//!
//! Everything here is `#[repr(C, packed)]` and byte-for-byte compatible
//! with the documented protocol (v2.15), so the structures can be memcpy'd
//! between the kernel image, host memory, and guest memory. `ByteValued`
//! provides those byte views safely.
//!
//! Reference: <https://www.kernel.org/doc/html/latest/arch/x86/boot.html>
//! Reference: <https://www.kernel.org/doc/html/latest/arch/x86/zero-page.html>

use vm_memory::ByteValued;

/// Size of the boot_params structure (one 4 KiB page).
pub const BOOT_PARAMS_SIZE: usize = 0x1000;

/// Offset of the setup header within boot_params and within the bzImage.
#[allow(dead_code)]
pub const SETUP_HEADER_OFFSET: usize = 0x1F1;

/// loadflags bit: protected-mode kernel is loaded at 0x100000.
pub const LOADED_HIGH: u8 = 1 << 0;

/// loadflags bit: do not reload segment registers in the entry stub.
pub const KEEP_SEGMENTS: u8 = 1 << 6;

/// loadflags bit: heap_end_ptr is valid.
pub const CAN_USE_HEAP: u8 = 1 << 7;

/// "HdrS" magic identifying a Linux setup header.
pub const SETUP_MAGIC: u32 = 0x5372_6448;

/// E820 region type for usable RAM.
pub const E820_RAM: u32 = 1;

/// One entry of the E820 memory map handed to the kernel.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct BootE820Entry {
    pub addr: u64,
    pub size: u64,
    pub entry_type: u32,
}

// SAFETY: plain integers, no padding, any bit pattern is valid.
unsafe impl ByteValued for BootE820Entry {}

/// The bzImage setup header, 0x7B bytes starting at offset 0x1F1.
///
/// Field order and widths follow boot protocol v2.15 exactly.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct SetupHeader {
    pub setup_sects: u8,
    pub root_flags: u16,
    pub syssize: u32,
    pub ram_size: u16,
    pub vid_mode: u16,
    pub root_dev: u16,
    pub boot_flag: u16,
    pub jump: u16,
    pub header: u32,
    pub version: u16,
    pub realmode_swtch: u32,
    pub start_sys_seg: u16,
    pub kernel_version: u16,
    pub type_of_loader: u8,
    pub loadflags: u8,
    pub setup_move_size: u16,
    pub code32_start: u32,
    pub ramdisk_image: u32,
    pub ramdisk_size: u32,
    pub bootsect_kludge: u32,
    pub heap_end_ptr: u16,
    pub ext_loader_ver: u8,
    pub ext_loader_type: u8,
    pub cmd_line_ptr: u32,
    pub initrd_addr_max: u32,
    pub kernel_alignment: u32,
    pub relocatable_kernel: u8,
    pub min_alignment: u8,
    pub xloadflags: u16,
    pub cmdline_size: u32,
    pub hardware_subarch: u32,
    pub hardware_subarch_data: u64,
    pub payload_offset: u32,
    pub payload_length: u32,
    pub setup_data: u64,
    pub pref_address: u64,
    pub init_size: u32,
    pub handover_offset: u32,
    pub kernel_info_offset: u32,
}

// SAFETY: plain integers, packed, any bit pattern is valid.
unsafe impl ByteValued for SetupHeader {}

/// The full zero page. Regions this VMM never touches are kept as raw byte
/// ranges; only their sizes matter for the layout.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct BootParams {
    pub screen_info: [u8; 0x40],          // 0x000
    pub apm_bios_info: [u8; 0x14],        // 0x040
    pub _pad2: [u8; 4],                   // 0x054
    pub tboot_addr: u64,                  // 0x058
    pub ist_info: [u8; 0x10],             // 0x060
    pub acpi_rsdp_addr: u64,              // 0x070
    pub _pad3: [u8; 8],                   // 0x078
    pub hd0_info: [u8; 16],               // 0x080
    pub hd1_info: [u8; 16],               // 0x090
    pub sys_desc_table: [u8; 0x10],       // 0x0A0
    pub olpc_ofw_header: [u8; 0x10],      // 0x0B0
    pub ext_ramdisk_image: u32,           // 0x0C0
    pub ext_ramdisk_size: u32,            // 0x0C4
    pub ext_cmd_line_ptr: u32,            // 0x0C8
    pub _pad4: [u8; 112],                 // 0x0CC
    pub cc_blob_address: u32,             // 0x13C
    pub edid_info: [u8; 0x80],            // 0x140
    pub efi_info: [u8; 0x20],             // 0x1C0
    pub alt_mem_k: u32,                   // 0x1E0
    pub scratch: u32,                     // 0x1E4
    pub e820_entries: u8,                 // 0x1E8
    pub eddbuf_entries: u8,               // 0x1E9
    pub edd_mbr_sig_buf_entries: u8,      // 0x1EA
    pub kbd_status: u8,                   // 0x1EB
    pub secure_boot: u8,                  // 0x1EC
    pub _pad5: [u8; 2],                   // 0x1ED
    pub sentinel: u8,                     // 0x1EF
    pub _pad6: [u8; 1],                   // 0x1F0
    pub hdr: SetupHeader,                 // 0x1F1
    pub _pad7: [u8; 0x24],                // 0x26C
    pub edd_mbr_sig_buffer: [u32; 16],    // 0x290
    pub e820_table: [BootE820Entry; 128], // 0x2D0
    pub _pad8: [u8; 48],                  // 0xCD0
    pub eddbuf: [u8; 0x1EC],              // 0xD00
    pub _pad9: [u8; 276],                 // 0xEEC
}

// SAFETY: plain integers and byte arrays, packed, any bit pattern is valid.
unsafe impl ByteValued for BootParams {}

impl Default for BootParams {
    fn default() -> Self {
        *Self::from_slice(&[0u8; BOOT_PARAMS_SIZE]).unwrap()
    }
}

impl BootParams {
    /// Append one E820 RAM entry covering `[addr, addr + size)`.
    pub fn add_e820_ram(&mut self, addr: u64, size: u64) {
        let index = self.e820_entries as usize;
        self.e820_table[index] = BootE820Entry {
            addr,
            size,
            entry_type: E820_RAM,
        };
        self.e820_entries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<BootParams>(), BOOT_PARAMS_SIZE);
        assert_eq!(size_of::<SetupHeader>(), 0x7B);
        assert_eq!(size_of::<BootE820Entry>(), 20);
    }

    #[test]
    fn test_zero_page_offsets() {
        assert_eq!(offset_of!(BootParams, e820_entries), 0x1E8);
        assert_eq!(offset_of!(BootParams, hdr), SETUP_HEADER_OFFSET);
        assert_eq!(offset_of!(BootParams, e820_table), 0x2D0);
    }

    #[test]
    fn test_setup_header_offsets() {
        // Documented absolute offsets within the zero page.
        let base = SETUP_HEADER_OFFSET;
        assert_eq!(base + offset_of!(SetupHeader, vid_mode), 0x1FA);
        assert_eq!(base + offset_of!(SetupHeader, boot_flag), 0x1FE);
        assert_eq!(base + offset_of!(SetupHeader, header), 0x202);
        assert_eq!(base + offset_of!(SetupHeader, version), 0x206);
        assert_eq!(base + offset_of!(SetupHeader, type_of_loader), 0x210);
        assert_eq!(base + offset_of!(SetupHeader, loadflags), 0x211);
        assert_eq!(base + offset_of!(SetupHeader, ramdisk_image), 0x218);
        assert_eq!(base + offset_of!(SetupHeader, heap_end_ptr), 0x224);
        assert_eq!(base + offset_of!(SetupHeader, cmd_line_ptr), 0x228);
        assert_eq!(base + offset_of!(SetupHeader, initrd_addr_max), 0x22C);
        assert_eq!(base + offset_of!(SetupHeader, cmdline_size), 0x238);
    }

    #[test]
    fn test_e820_append() {
        let mut params = BootParams::default();
        params.add_e820_ram(0, 0x10_0000);
        params.add_e820_ram(0x10_0000, 0x3FF0_0000);
        assert_eq!({ params.e820_entries }, 2);
        assert_eq!({ params.e820_table[1].addr }, 0x10_0000);
        assert_eq!({ params.e820_table[1].size }, 0x3FF0_0000);
        assert_eq!({ params.e820_table[1].entry_type }, E820_RAM);
    }

    #[test]
    fn test_byte_round_trip() {
        let mut params = BootParams::default();
        params.hdr.cmd_line_ptr = 0x2_0000;
        params.hdr.loadflags = LOADED_HIGH | CAN_USE_HEAP | KEEP_SEGMENTS;
        let bytes = params.as_slice().to_vec();
        assert_eq!(bytes.len(), BOOT_PARAMS_SIZE);
        assert_eq!(bytes[0x211], 0xC1);
        let decoded = BootParams::from_slice(&bytes).copied().unwrap();
        assert_eq!({ decoded.hdr.cmd_line_ptr }, 0x2_0000);
    }
}
