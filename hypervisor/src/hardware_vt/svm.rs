//! The module containing the [`Svm`] type, which implements the
//! [`hardware_vt::HardwareVt`] trait for AMD processors.
//!
//! The Secure Virtual Machine (SVM) extension implements AMD Virtualization
//! (AMD-V), the hardware assisted virtualization technology on AMD
//! processors.
//!
//! All references to external resources (denoted with "See:") refer to
//! "AMD64 Architecture Programmer's Manual Volume 2: System Programming"
//! unless otherwise stated.

use super::{
    ExecutionResources, GuestLayout, GuestRegisters, NestedPagingStructureEntryFlags,
    NestedPagingStructureEntryType, VmcbField, GUEST_CS_SELECTOR, GUEST_DS_SELECTOR,
    GUEST_OPEN_PORTS, GUEST_TR_SELECTOR, X2APIC_MSR_EOI, X2APIC_MSR_LVT_TIMER,
    X2APIC_MSR_TIMER_DIVIDER, X2APIC_MSR_TIMER_INITIAL_COUNT,
};
use crate::{
    hardware_vt::{
        self, CrAccessQualification, IoQualification, NestedPageFaultQualification, VmExitReason,
    },
    x86_instructions::{rdmsr, wrmsr},
};
use alloc::boxed::Box;
use core::{
    arch::global_asm,
    ptr::{addr_of, addr_of_mut},
};
use x86::current::rflags::RFlags;

/// SVM-specific data to represent a guest.
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
pub(crate) struct Svm {
    vmcb: Box<Vmcb>,
    /// The page the processor saves core host state into on VMRUN, named by
    /// the VM_HSAVE_PA MSR.
    #[derivative(Debug = "ignore")]
    host_state: Box<HostStateArea>,
    /// The page VMSAVE parks the additional host segment state in around
    /// the world switch.
    #[derivative(Debug = "ignore")]
    host_extra_state: Box<HostStateArea>,
    registers: GuestRegisters,
}

impl hardware_vt::HardwareVt for Svm {
    /// SVM control blocks carry no revision stamp.
    fn revision_id(&self) -> u32 {
        0
    }

    /// Enables SVM on the current processor and names the host state-save
    /// area.
    fn enable(&mut self) {
        const EFER_SVME: u64 = 1 << 12;
        const SVM_MSR_VM_HSAVE_PA: u32 = 0xc001_0117;

        // See: 15.4 Enabling SVM
        wrmsr(x86::msr::IA32_EFER, rdmsr(x86::msr::IA32_EFER) | EFER_SVME);

        // "The VMRUN instruction saves some host processor state information
        //  in the host state-save area in main memory at the physical
        //  address specified in the VM_HSAVE_PA MSR".
        // See: 15.5.1 Basic Operation
        wrmsr(SVM_MSR_VM_HSAVE_PA, addr_of!(*self.host_state) as u64);
    }

    /// The processor reloads host state through VM_HSAVE_PA and the VMSAVE
    /// page; nothing is programmed per field.
    fn prepare_host_state(&mut self) {}

    /// Guest state save area: flat 64-bit segments, paged long mode from
    /// the first instruction, descriptor tables at the fixed addresses the
    /// linker mapped.
    fn prepare_guest_state(&mut self, layout: &GuestLayout) {
        const EFER_SVME: u64 = 1 << 12;
        const EFER_LME_LMA_NXE: u64 = 0xd00;
        const CR0_PE_MP_NE_WP_PG: u64 = 0x8001_0023;
        const CR4_PAE_OSFXSR_OSXMMEXCPT_PGE: u64 = 0x6a0;
        const ATTRIB_CODE64: u16 = 0x29b;
        const ATTRIB_DATA64: u16 = 0xc93;
        const ATTRIB_TSS64: u16 = 0x089;
        const GPAT_WRITE_BACK: u64 = 0x0007_0406_0007_0406;

        let state = &mut self.vmcb.state_save_area;
        state.cs_selector = GUEST_CS_SELECTOR;
        state.cs_attrib = ATTRIB_CODE64;
        state.cs_limit = u32::MAX;
        state.cs_base = 0;
        for (selector, attrib, limit, base) in [
            (&mut state.es_selector, &mut state.es_attrib, &mut state.es_limit, &mut state.es_base),
            (&mut state.ss_selector, &mut state.ss_attrib, &mut state.ss_limit, &mut state.ss_base),
            (&mut state.ds_selector, &mut state.ds_attrib, &mut state.ds_limit, &mut state.ds_base),
            (&mut state.fs_selector, &mut state.fs_attrib, &mut state.fs_limit, &mut state.fs_base),
            (&mut state.gs_selector, &mut state.gs_attrib, &mut state.gs_limit, &mut state.gs_base),
        ] {
            *selector = GUEST_DS_SELECTOR;
            *attrib = ATTRIB_DATA64;
            *limit = u32::MAX;
            *base = 0;
        }
        state.tr_selector = GUEST_TR_SELECTOR;
        state.tr_attrib = ATTRIB_TSS64;
        state.tr_limit = layout.tr_limit as u32;
        state.tr_base = layout.tr_base;
        state.ldtr_selector = 0;
        state.ldtr_attrib = 0;
        state.ldtr_limit = 0;
        state.ldtr_base = 0;
        state.gdtr_base = layout.gdtr_base;
        state.gdtr_limit = layout.gdtr_limit as u32;
        state.idtr_base = layout.idtr_base;
        state.idtr_limit = layout.idtr_limit as u32;

        // SVME must remain set in the guest EFER.
        // See: 15.5.1 Basic Operation, "Canonicalization and Consistency
        //      Checks"
        state.efer = EFER_LME_LMA_NXE | EFER_SVME;
        state.cr0 = CR0_PE_MP_NE_WP_PG;
        state.cr3 = layout.cr3;
        state.cr4 = CR4_PAE_OSFXSR_OSXMMEXCPT_PGE;
        state.rip = layout.rip;
        state.rsp = 0;
        state.rflags = 0x2;
        state.rax = 0;
        state.dr6 = 0;
        state.dr7 = 0;
        state.cpl = 0;
        state.gpat = GPAT_WRITE_BACK;

        self.registers = GuestRegisters::default();
        self.registers.rip = layout.rip;
        self.registers.rflags = 0x2;
        self.registers.rdi = layout.rdi;
    }

    /// Interception policy: external interrupts, CPUID, RDTSC, HLT, INVLPG,
    /// VMMCALL, shutdown, CR3/CR8 accesses, and the port and MSR sets
    /// described by the permission maps.
    fn prepare_execution_control(&mut self, resources: &ExecutionResources) {
        const INTERCEPT_CR3_ACCESS: u16 = 1 << 3;
        const INTERCEPT_CR8_ACCESS: u16 = 1 << 8;
        const MISC1_INTR: u32 = 1 << 0;
        const MISC1_VINTR: u32 = 1 << 4;
        const MISC1_RDTSC: u32 = 1 << 14;
        const MISC1_CPUID: u32 = 1 << 18;
        const MISC1_PAUSE: u32 = 1 << 23;
        const MISC1_HLT: u32 = 1 << 24;
        const MISC1_INVLPG: u32 = 1 << 25;
        const MISC1_IOIO_PROT: u32 = 1 << 27;
        const MISC1_MSR_PROT: u32 = 1 << 28;
        const MISC1_SHUTDOWN: u32 = 1 << 31;
        const MISC2_VMRUN: u32 = 1 << 0;
        const MISC2_VMMCALL: u32 = 1 << 1;

        let control = &mut self.vmcb.control_area;
        control.intercept_cr_read = INTERCEPT_CR3_ACCESS | INTERCEPT_CR8_ACCESS;
        control.intercept_cr_write = INTERCEPT_CR3_ACCESS | INTERCEPT_CR8_ACCESS;
        control.intercept_exception = 0;
        control.intercept_misc1 = MISC1_INTR
            | MISC1_VINTR
            | MISC1_RDTSC
            | MISC1_CPUID
            | MISC1_PAUSE
            | MISC1_HLT
            | MISC1_INVLPG
            | MISC1_IOIO_PROT
            | MISC1_MSR_PROT
            | MISC1_SHUTDOWN;
        control.intercept_misc2 = MISC2_VMRUN | MISC2_VMMCALL;
        control.pause_filter_count = u16::MAX;

        // Address Space Identifier (ASID). Zero is reserved for the host.
        // See: 15.16 TLB Control
        control.guest_asid = 1;

        // IOPM: 12KB covering ports 0x0000-0xffff; a set bit intercepts.
        // See: 15.10.1 I/O Permissions Map
        let iopm =
            unsafe { core::slice::from_raw_parts_mut(resources.io_bitmap_base as *mut u8, 0x3000) };
        iopm.fill(0xff);
        for port in GUEST_OPEN_PORTS {
            iopm[usize::from(port >> 3)] &= !(1 << (port & 0x7));
        }
        control.iopm_base_pa = resources.io_bitmap_base;

        // MSRPM: two bits per MSR, read then write. Everything passes
        // except writes to the x2APIC timer registers and EOI (no
        // virtual-interrupt delivery on this back-end).
        // See: 15.11 MSR Intercepts
        let msrpm =
            unsafe { core::slice::from_raw_parts_mut(resources.msr_bitmap_base as *mut u8, 0x2000) };
        msrpm.fill(0);
        let mut trap_write = |msr: u32| {
            // Offset 0x800 covers MSRs 0xc000_0000.., 0x1000 covers
            // 0xc001_0000..; the x2APIC range sits in the first group.
            let (base, index) = match msr {
                0..=0x1fff => (0usize, msr as usize),
                0xc000_0000..=0xc000_1fff => (0x800, (msr - 0xc000_0000) as usize),
                _ => (0x1000, (msr - 0xc001_0000) as usize),
            };
            let bit = index * 2 + 1;
            msrpm[base + bit / 8] |= 1 << (bit % 8);
        };
        trap_write(X2APIC_MSR_LVT_TIMER);
        trap_write(X2APIC_MSR_TIMER_DIVIDER);
        trap_write(X2APIC_MSR_TIMER_INITIAL_COUNT);
        trap_write(X2APIC_MSR_EOI);
        control.msrpm_base_pa = resources.msr_bitmap_base;

        control.avic_apic_backing_page_pointer = resources.vapic_base;
    }

    /// Exit and entry state transfer is implicit in VMRUN/#VMEXIT; EFER and
    /// the long-mode state round-trip through the state save area.
    fn prepare_exit_and_entry_control(&mut self) {}

    /// Enables nested paging rooted at `nested_pml4_addr`.
    /// See: 15.25.3 Enabling Nested Paging
    fn prepare_nested_paging(&mut self, nested_pml4_addr: u64) {
        const SVM_NP_ENABLE: u64 = 1 << 0;
        self.vmcb.control_area.np_enable = SVM_NP_ENABLE;
        self.vmcb.control_area.ncr3 = nested_pml4_addr;
    }

    fn read(&self, field: VmcbField) -> u64 {
        let control = &self.vmcb.control_area;
        let state = &self.vmcb.state_save_area;
        match field {
            VmcbField::GuestRip => state.rip,
            VmcbField::GuestRsp => state.rsp,
            VmcbField::GuestRflags => state.rflags,
            VmcbField::GuestCr0 => state.cr0,
            VmcbField::GuestCr3 => state.cr3,
            VmcbField::GuestCr4 => state.cr4,
            VmcbField::GuestCr8 => u64::from(control.vintr & 0xff),
            VmcbField::GuestEfer => state.efer,
            VmcbField::GuestGdtrBase => state.gdtr_base,
            VmcbField::GuestIdtrBase => state.idtr_base,
            VmcbField::TscOffset => control.tsc_offset,
            VmcbField::ExitReason => control.exit_code,
            VmcbField::ExitQualification => control.exit_info1,
            VmcbField::ExitInfo2 => control.exit_info2,
            VmcbField::ExitInterruptionInfo => control.exit_int_info,
        }
    }

    fn write(&mut self, field: VmcbField, value: u64) {
        let control = &mut self.vmcb.control_area;
        let state = &mut self.vmcb.state_save_area;
        match field {
            VmcbField::GuestRip => state.rip = value,
            VmcbField::GuestRsp => state.rsp = value,
            VmcbField::GuestRflags => state.rflags = value,
            VmcbField::GuestCr0 => state.cr0 = value,
            VmcbField::GuestCr3 => state.cr3 = value,
            VmcbField::GuestCr4 => state.cr4 = value,
            VmcbField::GuestCr8 => {
                control.vintr = (control.vintr & !0xff) | (value & 0xff);
            }
            VmcbField::GuestEfer => state.efer = value,
            VmcbField::GuestGdtrBase => state.gdtr_base = value,
            VmcbField::GuestIdtrBase => state.idtr_base = value,
            VmcbField::TscOffset => control.tsc_offset = value,
            VmcbField::ExitReason
            | VmcbField::ExitQualification
            | VmcbField::ExitInfo2
            | VmcbField::ExitInterruptionInfo => {}
        }
    }

    fn registers(&self) -> &GuestRegisters {
        &self.registers
    }

    fn registers_mut(&mut self) -> &mut GuestRegisters {
        &mut self.registers
    }

    /// Executes the guest until #VMEXIT.
    fn run(&mut self) -> VmExitReason {
        const VMEXIT_CR3_READ: u64 = 0x03;
        const VMEXIT_CR8_READ: u64 = 0x08;
        const VMEXIT_CR3_WRITE: u64 = 0x13;
        const VMEXIT_CR8_WRITE: u64 = 0x18;
        const VMEXIT_INTR: u64 = 0x60;
        const VMEXIT_VINTR: u64 = 0x64;
        const VMEXIT_RDTSC: u64 = 0x6e;
        const VMEXIT_CPUID: u64 = 0x72;
        const VMEXIT_PAUSE: u64 = 0x77;
        const VMEXIT_HLT: u64 = 0x78;
        const VMEXIT_INVLPG: u64 = 0x79;
        const VMEXIT_IOIO: u64 = 0x7b;
        const VMEXIT_MSR: u64 = 0x7c;
        const VMEXIT_SHUTDOWN: u64 = 0x7f;
        const VMEXIT_VMMCALL: u64 = 0x81;
        const VMEXIT_NPF: u64 = 0x400;

        // RAX, RSP, RIP and RFLAGS travel through the state save area.
        self.vmcb.state_save_area.rax = self.registers.rax;
        self.vmcb.state_save_area.rip = self.registers.rip;
        self.vmcb.state_save_area.rsp = self.registers.rsp;
        self.vmcb.state_save_area.rflags = self.registers.rflags;

        unsafe {
            run_vm_svm(
                &mut self.registers,
                addr_of_mut!(*self.vmcb) as u64,
                addr_of!(*self.host_extra_state) as u64,
            );
        };

        self.registers.rax = self.vmcb.state_save_area.rax;
        self.registers.rip = self.vmcb.state_save_area.rip;
        self.registers.rsp = self.vmcb.state_save_area.rsp;
        self.registers.rflags = self.vmcb.state_save_area.rflags;

        // We might have requested flushing TLB. Clear the request, and the
        // consumed event injection so it does not replay on the next entry.
        self.vmcb.control_area.tlb_control = 0;
        self.vmcb.control_area.event_inj = 0;

        // "Saves the reason for exiting the guest in the VMCB's EXITCODE
        //  field."
        // See: 15.6 #VMEXIT, Appendix C SVM Intercept Exit Codes
        let control = &self.vmcb.control_area;
        match control.exit_code {
            VMEXIT_CR3_READ | VMEXIT_CR8_READ | VMEXIT_CR3_WRITE | VMEXIT_CR8_WRITE => {
                // With decode assists, EXITINFO1[3:0] carries the moved GPR.
                // See: 15.35.4 Decode Assists
                VmExitReason::CrAccess(CrAccessQualification {
                    register: if control.exit_code & 0xf == 0x3 { 3 } else { 8 },
                    write: control.exit_code >= VMEXIT_CR3_WRITE,
                    gpr: (control.exit_info1 & 0xf) as u8,
                })
            }
            VMEXIT_INTR => VmExitReason::ExternalInterrupt,
            VMEXIT_VINTR => VmExitReason::InterruptWindow,
            VMEXIT_RDTSC => VmExitReason::Rdtsc,
            VMEXIT_CPUID => VmExitReason::Cpuid,
            // The pause filter doubles as the time-slice bound.
            // See: 15.14.4 Pause Intercept Filtering
            VMEXIT_PAUSE => VmExitReason::TimerExpiration,
            VMEXIT_HLT => VmExitReason::Hlt,
            VMEXIT_INVLPG => VmExitReason::Invlpg,
            // See: 15.10.2 IN and OUT Behavior
            VMEXIT_IOIO => VmExitReason::Io(IoQualification {
                port: (control.exit_info1 >> 16) as u16,
                write: control.exit_info1 & 1 == 0,
                size: 1 << ((control.exit_info1 >> 4) & 0b111).trailing_zeros() as u8,
            }),
            VMEXIT_MSR => {
                if control.exit_info1 == 0 {
                    VmExitReason::Rdmsr
                } else {
                    VmExitReason::Wrmsr
                }
            }
            VMEXIT_SHUTDOWN => VmExitReason::Shutdown(control.exit_code),
            VMEXIT_VMMCALL => VmExitReason::Hypercall,
            // See: 15.25.6 Nested versus Guest Page Faults, Fault Ordering
            VMEXIT_NPF => VmExitReason::NestedPageFault(NestedPageFaultQualification {
                rip: self.registers.rip,
                gpa: control.exit_info2,
                missing_translation: (control.exit_info1 & 0b1) == 0,
                write_access: (control.exit_info1 & 0b10) != 0,
            }),
            _ => VmExitReason::Unexpected(control.exit_code),
        }
    }

    /// Queues an external interrupt through the event injection field.
    /// See: 15.20 Event Injection
    fn inject_interrupt(&mut self, vector: u8) {
        const EVENT_VALID: u64 = 1 << 31;
        self.vmcb.control_area.event_inj = EVENT_VALID | u64::from(vector);
    }

    fn interrupt_window_open(&self) -> bool {
        let rflags = RFlags::from_raw(self.registers.rflags);
        rflags.contains(RFlags::FLAGS_IF) && self.vmcb.control_area.interrupt_shadow == 0
    }

    /// Raises V_IRQ so the VINTR intercept fires once the guest can take an
    /// interrupt.
    /// See: 15.21.4 Interrupt Shadows, 15.21.5 Virtual Interrupt Intercept
    fn request_interrupt_window_exit(&mut self, enable: bool) {
        const V_IRQ: u64 = 1 << 8;
        const V_IGN_TPR: u64 = 1 << 20;
        if enable {
            self.vmcb.control_area.vintr |= V_IRQ | V_IGN_TPR;
        } else {
            self.vmcb.control_area.vintr &= !(V_IRQ | V_IGN_TPR);
        }
    }

    /// The next sequential instruction pointer is decoded by hardware.
    /// See: 15.7.1 State Saved on Exit
    fn advance_rip(&mut self) {
        self.registers.rip = self.vmcb.control_area.nrip;
        self.vmcb.state_save_area.rip = self.registers.rip;
    }

    /// Invalidates nested paging translations of this guest.
    fn invalidate_caches(&mut self) {
        // Flushes this guest's TLB entries on the next VMRUN.
        // See: Table 15-9. TLB Control Byte Encodings
        self.vmcb.control_area.tlb_control = 0b11;
    }

    /// Gets a flag value to be set to nested paging structure entries for
    /// the given entry types (eg, permissions).
    fn nps_entry_flags(
        &self,
        entry_type: NestedPagingStructureEntryType,
    ) -> NestedPagingStructureEntryFlags {
        // SVM uses the exact same layout as the standard paging structure
        // entries for nested paging structure entries. Leaving PWT, PCD and
        // PAT zero yields the write-back memory type, so the write-back
        // variants collapse onto the plain ones.
        match entry_type {
            NestedPagingStructureEntryType::Rwx | NestedPagingStructureEntryType::RwxWriteBack => {
                NestedPagingStructureEntryFlags {
                    permission: 0b111,
                    memory_type: 0,
                }
            }
            NestedPagingStructureEntryType::RxWriteBack => NestedPagingStructureEntryFlags {
                permission: 0b101,
                memory_type: 0,
            },
        }
    }
}

impl Svm {
    pub(crate) fn new() -> Self {
        let vmcb = unsafe { Box::<Vmcb>::new_zeroed().assume_init() };
        let host_state = unsafe { Box::<HostStateArea>::new_zeroed().assume_init() };
        let host_extra_state = unsafe { Box::<HostStateArea>::new_zeroed().assume_init() };
        Self {
            vmcb,
            host_state,
            host_extra_state,
            ..Default::default()
        }
    }
}

/// The virtual machine control block (VMCB), which describes a virtual
/// machine (guest) to be executed.
///
/// See: Appendix B Layout of VMCB
#[derive(Debug, Default)]
#[repr(C, align(4096))]
struct Vmcb {
    control_area: ControlArea,
    state_save_area: StateSaveArea,
}
const _: () = assert!(size_of::<Vmcb>() == 0x1000);

/// The "metadata" area where we can specify what operations to intercept
/// and can read details of #VMEXIT.
///
/// See: Table B-1. VMCB Layout, Control Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
struct ControlArea {
    intercept_cr_read: u16,   // +0x000
    intercept_cr_write: u16,  // +0x002
    intercept_dr_read: u16,   // +0x004
    intercept_dr_write: u16,  // +0x006
    intercept_exception: u32, // +0x008
    intercept_misc1: u32,     // +0x00c
    intercept_misc2: u32,     // +0x010
    intercept_misc3: u32,     // +0x014
    #[derivative(Debug = "ignore", Default(value = "[0; 36]"))]
    _padding1: [u8; 0x03c - 0x018], // +0x018
    pause_filter_threshold: u16, // +0x03c
    pause_filter_count: u16,  // +0x03e
    iopm_base_pa: u64,        // +0x040
    msrpm_base_pa: u64,       // +0x048
    tsc_offset: u64,          // +0x050
    guest_asid: u32,          // +0x058
    tlb_control: u32,         // +0x05c
    vintr: u64,               // +0x060
    interrupt_shadow: u64,    // +0x068
    exit_code: u64,           // +0x070
    exit_info1: u64,          // +0x078
    exit_info2: u64,          // +0x080
    exit_int_info: u64,       // +0x088
    np_enable: u64,           // +0x090
    avic_apic_bar: u64,       // +0x098
    guest_pa_pf_ghcb: u64,    // +0x0a0
    event_inj: u64,           // +0x0a8
    ncr3: u64,                // +0x0b0
    lbr_virtualization_enable: u64, // +0x0b8
    vmcb_clean: u64,          // +0x0c0
    nrip: u64,                // +0x0c8
    num_of_bytes_fetched: u8, // +0x0d0
    guest_instruction_bytes: [u8; 15], // +0x0d1
    avic_apic_backing_page_pointer: u64, // +0x0e0
    #[derivative(Debug = "ignore")]
    _padding2: u64, // +0x0e8
    avic_logical_table_pointer: u64, // +0x0f0
    avic_physical_table_pointer: u64, // +0x0f8
    #[derivative(Debug = "ignore")]
    _padding3: u64, // +0x100
    vmcb_save_state_pointer: u64, // +0x108
    #[derivative(Debug = "ignore", Default(value = "[0; 720]"))]
    _padding4: [u8; 0x3e0 - 0x110], // +0x110
    reserved_for_host: [u8; 0x20], // +0x3e0
}
const _: () = assert!(size_of::<ControlArea>() == 0x400);

/// The area to specify and read guest register values.
///
/// See: Table B-2. VMCB Layout, State Save Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
struct StateSaveArea {
    es_selector: u16,   // +0x000
    es_attrib: u16,     // +0x002
    es_limit: u32,      // +0x004
    es_base: u64,       // +0x008
    cs_selector: u16,   // +0x010
    cs_attrib: u16,     // +0x012
    cs_limit: u32,      // +0x014
    cs_base: u64,       // +0x018
    ss_selector: u16,   // +0x020
    ss_attrib: u16,     // +0x022
    ss_limit: u32,      // +0x024
    ss_base: u64,       // +0x028
    ds_selector: u16,   // +0x030
    ds_attrib: u16,     // +0x032
    ds_limit: u32,      // +0x034
    ds_base: u64,       // +0x038
    fs_selector: u16,   // +0x040
    fs_attrib: u16,     // +0x042
    fs_limit: u32,      // +0x044
    fs_base: u64,       // +0x048
    gs_selector: u16,   // +0x050
    gs_attrib: u16,     // +0x052
    gs_limit: u32,      // +0x054
    gs_base: u64,       // +0x058
    gdtr_selector: u16, // +0x060
    gdtr_attrib: u16,   // +0x062
    gdtr_limit: u32,    // +0x064
    gdtr_base: u64,     // +0x068
    ldtr_selector: u16, // +0x070
    ldtr_attrib: u16,   // +0x072
    ldtr_limit: u32,    // +0x074
    ldtr_base: u64,     // +0x078
    idtr_selector: u16, // +0x080
    idtr_attrib: u16,   // +0x082
    idtr_limit: u32,    // +0x084
    idtr_base: u64,     // +0x088
    tr_selector: u16,   // +0x090
    tr_attrib: u16,     // +0x092
    tr_limit: u32,      // +0x094
    tr_base: u64,       // +0x098
    #[derivative(Debug = "ignore", Default(value = "[0; 43]"))]
    _padding1: [u8; 0x0cb - 0x0a0], // +0x0a0
    cpl: u8,            // +0x0cb
    #[derivative(Debug = "ignore")]
    _padding2: u32, // +0x0cc
    efer: u64,          // +0x0d0
    #[derivative(Debug = "ignore", Default(value = "[0; 112]"))]
    _padding3: [u8; 0x148 - 0x0d8], // +0x0d8
    cr4: u64,           // +0x148
    cr3: u64,           // +0x150
    cr0: u64,           // +0x158
    dr7: u64,           // +0x160
    dr6: u64,           // +0x168
    rflags: u64,        // +0x170
    rip: u64,           // +0x178
    #[derivative(Debug = "ignore", Default(value = "[0; 88]"))]
    _padding4: [u8; 0x1d8 - 0x180], // +0x180
    rsp: u64,           // +0x1d8
    s_cet: u64,         // +0x1e0
    ssp: u64,           // +0x1e8
    isst_addr: u64,     // +0x1f0
    rax: u64,           // +0x1f8
    star: u64,          // +0x200
    lstar: u64,         // +0x208
    cstar: u64,         // +0x210
    sf_mask: u64,       // +0x218
    kernel_gs_base: u64, // +0x220
    sysenter_cs: u64,   // +0x228
    sysenter_esp: u64,  // +0x230
    sysenter_eip: u64,  // +0x238
    cr2: u64,           // +0x240
    #[derivative(Debug = "ignore", Default(value = "[0; 32]"))]
    _padding5: [u8; 0x268 - 0x248], // +0x248
    gpat: u64,          // +0x268
    dbg_ctl: u64,       // +0x270
    br_from: u64,       // +0x278
    br_to: u64,         // +0x280
    last_excep_from: u64, // +0x288
    last_excep_to: u64, // +0x290
    #[derivative(Debug = "ignore", Default(value = "[0; 71]"))]
    _padding6: [u8; 0x2df - 0x298], // +0x298
    spec_ctl: u64,      // +0x2e0
}
const _: () = assert!(size_of::<StateSaveArea>() == 0x2e8);

/// 4KB block of memory for host state around the world switch: one page
/// for the VM_HSAVE_PA MSR, a second one for VMSAVE/VMLOAD.
///
/// See: 15.30.4 VM_HSAVE_PA MSR (C001_0117h)
#[allow(clippy::doc_markdown)]
#[repr(C, align(4096))]
struct HostStateArea([u8; 0x1000]);
const _: () = assert!(size_of::<HostStateArea>() == 0x1000);

impl Default for HostStateArea {
    fn default() -> Self {
        Self([0; 4096])
    }
}

extern "efiapi" {
    /// Runs the guest until #VMEXIT occurs.
    fn run_vm_svm(registers: &mut GuestRegisters, guest_vmcb_pa: u64, host_save_pa: u64);
}
global_asm!(include_str!("svm_run_vm.S"));
