//! The VM orchestrator: owns the machine, its memory, and its devices, and
//! drives the run loop.
//!
//! Construction brings the machine up in a fixed order - subsystem handle,
//! VM, control structures, interrupt controllers, memory, vCPU, CPUID,
//! protected mode, devices - because several KVM ioctls are only valid in
//! that order. Loading stages the kernel per the boot protocol. Running
//! then alternates between the guest and the PIO device layer until the
//! guest halts or shuts down.
//!
//! Device dispatch priority is the registration order: COM1 and the PS/2
//! controller first, then the PCI subsystem as a catch-all over the whole
//! port space, so config-mechanism and BAR traffic lands there without
//! shadowing the legacy devices.

use crate::boot::{self, layout, GuestMemory};
use crate::devices::serial::SERIAL_IRQ;
use crate::devices::{
    pci::{PciBus, VirtioNet},
    IrqLine, I8042, PioBus, Serial, I8042_COMMAND_PORT, I8042_DATA_PORT, SERIAL_COM1_BASE,
    SERIAL_COM1_END,
};
use crate::error::{Result, VmmError};
use crate::kvm::{self, PortIoHandler, Vcpu, VcpuExit, Vm};
use kvm_bindings::{kvm_regs, kvm_segment};
use std::sync::{Arc, Mutex};

/// Default kernel command line.
pub const DEFAULT_CMDLINE: &str = "console=ttyS0";

/// Port 0x61 (NMI status): the guest polls bit 5 to see the PIT channel 2
/// output; answering with it set keeps early-boot delay loops moving.
const NMI_STATUS_PORT: u16 = 0x61;
const NMI_STATUS_PIT_CH2_OUT: u8 = 0x20;

/// CR0.PE: protected mode enable.
const CR0_PE: u64 = 0x1;

/// Configuration record handed over from the CLI.
pub struct VmmConfig {
    /// Guest memory size in bytes.
    pub memory_bytes: u64,
}

/// COM1's interrupt, delivered as an edge on IRQ 4 through the in-kernel
/// interrupt controller.
struct SerialIrq(Arc<Vm>);

impl IrqLine for SerialIrq {
    fn pulse(&self) -> Result<()> {
        self.0.pulse_irq(SERIAL_IRQ)
    }
}

/// A running virtual machine.
pub struct Vmm {
    #[allow(dead_code)]
    vm: Arc<Vm>,
    vcpu: Vcpu,
    memory: GuestMemory,
    bus: PioBus,
    serial: Arc<Mutex<Serial>>,
}

impl Vmm {
    /// Bring up the machine. See the module docs for why the order is
    /// rigid; each step aborts with a specific error kind.
    pub fn new(config: &VmmConfig) -> Result<Self> {
        let mem_size = config.memory_bytes;

        let kvm = kvm::open()?;
        let vm = Arc::new(Vm::new(&kvm)?);

        // Control structures live in the four pages above guest RAM,
        // where the guest cannot reach them.
        vm.place_tss(mem_size)?;
        vm.place_identity_map(mem_size)?;

        vm.create_irq_chip()?;
        vm.create_pit()?;

        let memory = GuestMemory::new(mem_size)?;
        // SAFETY: `memory` lives in this Vmm alongside `vm` and is never
        // resized; the mapping outlives every use of the VM fd.
        unsafe {
            vm.register_memory(0, 0, mem_size, memory.host_address()?)?;
        }

        let vcpu = vm.create_vcpu(0)?;

        let mut cpuid = kvm::supported_cpuid(&kvm)?;
        kvm::shape_cpuid(&mut cpuid)?;
        vcpu.set_cpuid(&cpuid)?;

        set_flat_protected_mode(&vcpu)?;

        let serial = Arc::new(Mutex::new(Serial::new(Box::new(SerialIrq(vm.clone())))));
        let i8042 = Arc::new(Mutex::new(I8042::new()));
        let mut pci = PciBus::new();
        pci.add_device(Box::new(VirtioNet::new()));
        let pci = Arc::new(Mutex::new(pci));

        let mut bus = PioBus::new();
        bus.add(SERIAL_COM1_BASE, SERIAL_COM1_END, serial.clone());
        bus.add(I8042_DATA_PORT, I8042_COMMAND_PORT, i8042);
        bus.add(0x0000, 0xFFFF, pci);

        eprintln!("[VMM] machine up: {} MiB, 1 vCPU", mem_size >> 20);

        Ok(Self {
            vm,
            vcpu,
            memory,
            bus,
            serial,
        })
    }

    /// Stage kernel, optional initrd, and the command line, then point the
    /// vCPU at the protected-mode entry.
    pub fn load(&mut self, kernel: &[u8], initrd: &[u8], cmdline: &str) -> Result<()> {
        boot::load(&self.memory, kernel, initrd, cmdline)?;

        let regs = kvm_regs {
            rip: layout::KERNEL_START,
            rsi: layout::BOOT_PARAMS_START,
            rflags: 0x2,
            ..Default::default()
        };
        self.vcpu.set_regs(&regs)
    }

    /// Handle to the UART for the TTY input pump.
    pub fn serial(&self) -> Arc<Mutex<Serial>> {
        self.serial.clone()
    }

    /// Guest memory, for inspection.
    #[allow(dead_code)]
    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    /// The single vCPU, for inspection.
    #[allow(dead_code)]
    pub fn vcpu(&self) -> &Vcpu {
        &self.vcpu
    }

    /// Run the guest until it halts or shuts down.
    pub fn run(&mut self) -> Result<()> {
        let mut handler = ExitHandler { bus: &self.bus };
        loop {
            match self.vcpu.run_with_io(&mut handler)? {
                VcpuExit::Io => {}
                VcpuExit::Hlt => {
                    eprintln!("[VMM] guest halted");
                    return Ok(());
                }
                VcpuExit::Shutdown => {
                    eprintln!("[VMM] guest shut down");
                    return Ok(());
                }
                VcpuExit::Unexpected(reason) => {
                    if let Ok(regs) = self.vcpu.get_regs() {
                        let phys = self
                            .vcpu
                            .translate(regs.rip)
                            .map(|t| t.physical_address)
                            .unwrap_or(0);
                        eprintln!(
                            "[VMM] unexpected exit at rip {:#x} (phys {phys:#x}): {reason}",
                            regs.rip
                        );
                    }
                    return Err(VmmError::UnexpectedExit(reason));
                }
            }
        }
    }
}

/// Route port I/O exits to the device registry. Reads of the NMI status
/// port are answered inline, ahead of dispatch.
struct ExitHandler<'a> {
    bus: &'a PioBus,
}

impl PortIoHandler for ExitHandler<'_> {
    fn pio_in(&mut self, port: u16, data: &mut [u8]) {
        if port == NMI_STATUS_PORT {
            data[0] = NMI_STATUS_PIT_CH2_OUT;
            return;
        }
        self.bus.pio_in(port, data);
    }

    fn pio_out(&mut self, port: u16, data: &[u8]) {
        self.bus.pio_out(port, data);
    }
}

/// Switch the vCPU to flat 32-bit protected mode: every segment spans the
/// full 4 GiB with page granularity, CS/SS are 32-bit, CR0.PE is set.
/// Everything else keeps its reset value; the kernel's own startup code
/// takes it from here.
fn set_flat_protected_mode(vcpu: &Vcpu) -> Result<()> {
    let mut sregs = vcpu.get_sregs()?;

    let flatten = |seg: &mut kvm_segment| {
        seg.base = 0;
        seg.limit = 0xFFFF_FFFF;
        seg.g = 1;
    };
    flatten(&mut sregs.cs);
    flatten(&mut sregs.ds);
    flatten(&mut sregs.es);
    flatten(&mut sregs.fs);
    flatten(&mut sregs.gs);
    flatten(&mut sregs.ss);
    sregs.cs.db = 1;
    sregs.ss.db = 1;

    sregs.cr0 |= CR0_PE;

    vcpu.set_sregs(&sregs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvm::KVM_CPUID_SIGNATURE;

    fn gib() -> u64 {
        1 << 30
    }

    fn fresh_vmm() -> Option<Vmm> {
        if !kvm::kvm_available() {
            return None;
        }
        Some(Vmm::new(&VmmConfig { memory_bytes: gib() }).unwrap())
    }

    #[test]
    fn test_flat_protected_mode_after_init() {
        let Some(vmm) = fresh_vmm() else { return };
        let sregs = vmm.vcpu().get_sregs().unwrap();
        assert_eq!(sregs.cs.base, 0);
        assert_eq!(sregs.cs.limit, 0xFFFF_FFFF);
        assert_eq!(sregs.cs.g, 1);
        assert_eq!(sregs.cs.db, 1);
        assert_eq!(sregs.ss.db, 1);
        assert_eq!(sregs.cr0 & CR0_PE, CR0_PE);
    }

    #[test]
    fn test_load_stages_cmdline_and_shapes_cpuid() {
        let Some(mut vmm) = fresh_vmm() else { return };
        let kernel = crate::boot::test_bzimage();
        vmm.load(&kernel, &[], DEFAULT_CMDLINE).unwrap();

        let mut cmdline = vec![0u8; DEFAULT_CMDLINE.len()];
        vmm.memory().read(layout::CMDLINE_START, &mut cmdline).unwrap();
        assert_eq!(cmdline, DEFAULT_CMDLINE.as_bytes());

        let cpuid = vmm.vcpu().get_cpuid().unwrap();
        let signature = cpuid
            .as_slice()
            .iter()
            .find(|e| e.function == KVM_CPUID_SIGNATURE)
            .expect("signature leaf must be installed");
        assert_eq!(signature.eax, 0x4000_0001);
        assert_eq!(signature.ebx, 0x4B4D_564B);
        assert_eq!(signature.ecx, 0x564B_4D56);
        assert_eq!(signature.edx, 0x0000_004D);

        let regs = vmm.vcpu().get_regs().unwrap();
        assert_eq!(regs.rip, layout::KERNEL_START);
        assert_eq!(regs.rsi, layout::BOOT_PARAMS_START);
        assert_eq!(regs.rflags, 0x2);
    }

    /// A 16-bit real-mode loop that writes an incrementing 32-bit counter
    /// to port 0x10, driven through the raw kvm layer (no protected-mode
    /// switch, no boot protocol).
    #[test]
    fn test_real_mode_guest_out_counter() {
        if !kvm::kvm_available() {
            return;
        }

        // xor eax,eax; mov dx,0x10; l: out dx,eax; inc eax; jmp l
        const BLOB: &[u8] = &[
            0x66, 0x31, 0xC0, // xor eax, eax
            0xBA, 0x10, 0x00, // mov dx, 0x10
            0x66, 0xEF, // out dx, eax
            0x66, 0x40, // inc eax
            0xEB, 0xFA, // jmp to the out
        ];

        let kvm = kvm::open().unwrap();
        let vm = Vm::new(&kvm).unwrap();
        let mem_size = 0x10000u64;
        vm.place_tss(mem_size).unwrap();
        vm.place_identity_map(mem_size).unwrap();
        vm.create_irq_chip().unwrap();
        vm.create_pit().unwrap();

        let memory = GuestMemory::new(mem_size).unwrap();
        unsafe {
            vm.register_memory(0, 0, mem_size, memory.host_address().unwrap())
                .unwrap();
        }
        memory.write(0, BLOB).unwrap();

        let mut vcpu = vm.create_vcpu(0).unwrap();
        let mut sregs = vcpu.get_sregs().unwrap();
        sregs.cs.base = 0;
        sregs.cs.selector = 0;
        vcpu.set_sregs(&sregs).unwrap();
        vcpu.set_regs(&kvm_regs {
            rip: 0,
            rflags: 0x2,
            ..Default::default()
        })
        .unwrap();

        struct OutCollector(Vec<(u16, u32)>);
        impl PortIoHandler for OutCollector {
            fn pio_in(&mut self, _port: u16, _data: &mut [u8]) {}
            fn pio_out(&mut self, port: u16, data: &[u8]) {
                let mut word = [0u8; 4];
                word[..data.len()].copy_from_slice(data);
                self.0.push((port, u32::from_le_bytes(word)));
            }
        }

        let mut collector = OutCollector(Vec::new());
        for _ in 0..3 {
            match vcpu.run_with_io(&mut collector).unwrap() {
                VcpuExit::Io => {}
                other => panic!("expected an I/O exit, got {other:?}"),
            }
        }
        assert_eq!(
            collector.0,
            vec![(0x10, 0), (0x10, 1), (0x10, 2)],
            "first three exits must be OUTs of 0, 1, 2 to port 0x10"
        );
    }
}
