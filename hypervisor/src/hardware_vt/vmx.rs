//! The module containing the [`Vmx`] type, which implements the
//! [`hardware_vt::HardwareVt`] trait for Intel processors.
//!
//! The virtual-machine extensions (VMX) implement Intel Virtualization
//! Technology (VT-x), the hardware assisted virtualization technology on
//! Intel processors.
//!
//! All references to external resources (denoted with "See:") refer to
//! "Intel 64 and IA-32 Architectures Software Developer's Manual Volume 3"
//! unless otherwise stated.

use super::{
    ExecutionResources, GuestLayout, GuestRegisters, NestedPagingStructureEntryFlags,
    NestedPagingStructureEntryType, VmcbField, GUEST_CS_SELECTOR, GUEST_DS_SELECTOR,
    GUEST_OPEN_PORTS, GUEST_TR_SELECTOR, X2APIC_MSR_EOI, X2APIC_MSR_LVT_TIMER,
    X2APIC_MSR_TIMER_DIVIDER, X2APIC_MSR_TIMER_INITIAL_COUNT,
};
use crate::{
    config::GUEST_TIME_SLICE_IN_TSC,
    hardware_vt::{
        self, CrAccessQualification, IoQualification, NestedPageFaultQualification, VmExitReason,
    },
    x86_instructions::{cr0, cr0_write, cr3, cr4, cr4_write, rdmsr, sgdt, sidt, wrmsr},
};
use alloc::{
    boxed::Box,
    format,
    string::{String, ToString},
    vec::Vec,
};
use core::{
    arch::{asm, global_asm},
    fmt,
    ptr::addr_of_mut,
};
use log::{debug, warn};
use x86::{
    controlregs::{Cr0, Cr4},
    current::rflags::RFlags,
    dtables::DescriptorTablePointer,
    segmentation::{
        BuildDescriptor, Descriptor, DescriptorBuilder, GateDescriptorBuilder, SegmentSelector,
    },
    vmx::vmcs,
};

/// VMX-specific data to represent a guest.
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
pub(crate) struct Vmx {
    #[derivative(Debug = "ignore")]
    vmxon_region: Box<Vmxon>,
    vmcs_region: Box<Vmcs>,
    #[derivative(Debug = "ignore")]
    host_gdt: HostGdt,
    registers: GuestRegisters,
    /// Whether [`Vmx::vmcs_region`] is already in the launched state.
    launched: bool,
    /// The scale to convert TSC into the unit used for the VMX-preemption
    /// timer. None when the timer is unsupported.
    timer_scale: Option<u64>,
}

impl hardware_vt::HardwareVt for Vmx {
    /// The VMCS revision identifier the hardware demands.
    fn revision_id(&self) -> u32 {
        rdmsr(x86::msr::IA32_VMX_BASIC) as u32
    }

    /// Enters VMX root operation and makes the VMCS of this guest current.
    fn enable(&mut self) {
        // "Before system software can enter VMX operation, it enables VMX by
        //  setting CR4.VMXE[bit 13] = 1."
        // See: 24.7 ENABLING AND ENTERING VMX OPERATION
        cr4_write(cr4() | Cr4::CR4_ENABLE_VMX);

        // VMXON requires the lock bit of IA32_FEATURE_CONTROL and fixed CR0
        // bits to hold their architectural values.
        // See: 24.8 RESTRICTIONS ON VMX OPERATION
        adjust_feature_control_msr();
        adjust_cr0();

        // The VMXON region and the VMCS both start with the revision id.
        // See: 25.2 FORMAT OF THE VMCS REGION
        let revision_id = self.revision_id();
        self.vmxon_region.revision_id = revision_id;
        vmxon(&mut self.vmxon_region);

        // Make the VMCS clear, then active and current, so that VMREAD and
        // VMWRITE operate on it.
        // See: 25.11.3 Initializing a VMCS
        self.vmcs_region.revision_id = revision_id;
        vmclear(&mut self.vmcs_region);
        vmptrld(&mut self.vmcs_region);
    }

    /// Host-State Fields. Largely the current register values, with a
    /// private GDT carrying the TSS the DXE phase lacks. RIP and RSP are
    /// written by the world-switch code on every entry.
    fn prepare_host_state(&mut self) {
        self.host_gdt.initialize_from_current();
        let mut idtr = DescriptorTablePointer::<u64>::default();
        sidt(&mut idtr);
        vmwrite(vmcs::host::CS_SELECTOR, self.host_gdt.cs.bits());
        vmwrite(vmcs::host::TR_SELECTOR, self.host_gdt.tr.bits());
        vmwrite(vmcs::host::CR0, cr0().bits() as u64);
        vmwrite(vmcs::host::CR3, cr3());
        vmwrite(vmcs::host::CR4, cr4().bits() as u64);
        vmwrite(vmcs::host::TR_BASE, self.host_gdt.tss.0.as_ptr() as u64);
        vmwrite(vmcs::host::GDTR_BASE, self.host_gdt.gdtr.base as u64);
        vmwrite(vmcs::host::IDTR_BASE, idtr.base as u64);
        vmwrite(vmcs::host::IA32_EFER_FULL, rdmsr(x86::msr::IA32_EFER));
    }

    /// Guest-State Fields: flat 64-bit segments, paged long mode from the
    /// first instruction, descriptor tables at the fixed addresses the
    /// linker mapped.
    fn prepare_guest_state(&mut self, layout: &GuestLayout) {
        const EFER_LME_LMA_NXE: u64 = 0xd00;
        const ACCESS_RIGHTS_CODE64: u32 = 0xa09b;
        const ACCESS_RIGHTS_DATA64: u32 = 0xc093;
        const ACCESS_RIGHTS_TSS64: u32 = 0x008b;
        const ACCESS_RIGHTS_UNUSABLE: u32 = 1 << 16;

        vmwrite(vmcs::guest::ES_SELECTOR, GUEST_DS_SELECTOR);
        vmwrite(vmcs::guest::CS_SELECTOR, GUEST_CS_SELECTOR);
        vmwrite(vmcs::guest::SS_SELECTOR, GUEST_DS_SELECTOR);
        vmwrite(vmcs::guest::DS_SELECTOR, GUEST_DS_SELECTOR);
        vmwrite(vmcs::guest::FS_SELECTOR, GUEST_DS_SELECTOR);
        vmwrite(vmcs::guest::GS_SELECTOR, GUEST_DS_SELECTOR);
        vmwrite(vmcs::guest::TR_SELECTOR, GUEST_TR_SELECTOR);
        vmwrite(vmcs::guest::LDTR_SELECTOR, 0u16);
        for base in [
            vmcs::guest::ES_BASE,
            vmcs::guest::CS_BASE,
            vmcs::guest::SS_BASE,
            vmcs::guest::DS_BASE,
            vmcs::guest::FS_BASE,
            vmcs::guest::GS_BASE,
            vmcs::guest::LDTR_BASE,
        ] {
            vmwrite(base, 0u64);
        }
        for limit in [
            vmcs::guest::ES_LIMIT,
            vmcs::guest::CS_LIMIT,
            vmcs::guest::SS_LIMIT,
            vmcs::guest::DS_LIMIT,
            vmcs::guest::FS_LIMIT,
            vmcs::guest::GS_LIMIT,
        ] {
            vmwrite(limit, u32::MAX);
        }
        vmwrite(vmcs::guest::LDTR_LIMIT, 0u32);
        vmwrite(vmcs::guest::CS_ACCESS_RIGHTS, ACCESS_RIGHTS_CODE64);
        for ar in [
            vmcs::guest::ES_ACCESS_RIGHTS,
            vmcs::guest::SS_ACCESS_RIGHTS,
            vmcs::guest::DS_ACCESS_RIGHTS,
            vmcs::guest::FS_ACCESS_RIGHTS,
            vmcs::guest::GS_ACCESS_RIGHTS,
        ] {
            vmwrite(ar, ACCESS_RIGHTS_DATA64);
        }
        vmwrite(vmcs::guest::TR_ACCESS_RIGHTS, ACCESS_RIGHTS_TSS64);
        vmwrite(vmcs::guest::LDTR_ACCESS_RIGHTS, ACCESS_RIGHTS_UNUSABLE);

        vmwrite(vmcs::guest::GDTR_BASE, layout.gdtr_base);
        vmwrite(vmcs::guest::GDTR_LIMIT, layout.gdtr_limit as u32);
        vmwrite(vmcs::guest::IDTR_BASE, layout.idtr_base);
        vmwrite(vmcs::guest::IDTR_LIMIT, layout.idtr_limit as u32);
        vmwrite(vmcs::guest::TR_BASE, layout.tr_base);
        vmwrite(vmcs::guest::TR_LIMIT, layout.tr_limit as u32);

        // CR0 {PE, MP, NE, WP, PG} and CR4 {PAE, OSFXSR, OSXMMEXCPT, PGE}
        // on top of the FIXED0 requirements.
        let cr0_value = rdmsr(x86::msr::IA32_VMX_CR0_FIXED0)
            | (Cr0::CR0_PROTECTED_MODE
                | Cr0::CR0_MONITOR_COPROCESSOR
                | Cr0::CR0_NUMERIC_ERROR
                | Cr0::CR0_WRITE_PROTECT
                | Cr0::CR0_ENABLE_PAGING)
                .bits() as u64;
        vmwrite(vmcs::guest::CR0, cr0_value);
        vmwrite(vmcs::guest::CR3, layout.cr3);
        let cr4_value = rdmsr(x86::msr::IA32_VMX_CR4_FIXED0)
            | (Cr4::CR4_ENABLE_PAE
                | Cr4::CR4_ENABLE_SSE
                | Cr4::CR4_UNMASKED_SSE
                | Cr4::CR4_ENABLE_GLOBAL_PAGES)
                .bits() as u64;
        vmwrite(vmcs::guest::CR4, cr4_value);
        vmwrite(vmcs::guest::IA32_EFER_FULL, EFER_LME_LMA_NXE);

        vmwrite(vmcs::guest::DR7, 0u64);
        vmwrite(vmcs::guest::RIP, layout.rip);
        vmwrite(vmcs::guest::RSP, 0u64);
        vmwrite(vmcs::guest::RFLAGS, 0x2u64);
        vmwrite(vmcs::guest::LINK_PTR_FULL, u64::MAX);
        vmwrite(vmcs::guest::INTERRUPTIBILITY_STATE, 0u32);
        vmwrite(vmcs::guest::ACTIVITY_STATE, 0u32);

        self.registers = GuestRegisters::default();
        self.registers.rip = layout.rip;
        self.registers.rflags = 0x2;
        self.registers.rdi = layout.rdi;
    }

    /// Interception policy: HLT, INVLPG, RDTSC, CR3/CR8 accesses and
    /// selected I/O and MSR accesses trap; nested paging, VPID and the
    /// unrestricted guest come from the secondary controls.
    fn prepare_execution_control(&mut self, resources: &ExecutionResources) {
        const PIN_EXTERNAL_INTERRUPT_EXITING: u64 = 1 << 0;
        const PRI_HLT_EXITING: u64 = 1 << 7;
        const PRI_INVLPG_EXITING: u64 = 1 << 9;
        const PRI_RDTSC_EXITING: u64 = 1 << 12;
        const PRI_CR3_LOAD_EXITING: u64 = 1 << 15;
        const PRI_CR3_STORE_EXITING: u64 = 1 << 16;
        const PRI_CR8_LOAD_EXITING: u64 = 1 << 19;
        const PRI_CR8_STORE_EXITING: u64 = 1 << 20;
        const PRI_USE_TPR_SHADOW: u64 = 1 << 21;
        const PRI_USE_IO_BITMAPS: u64 = 1 << 25;
        const PRI_USE_MSR_BITMAPS: u64 = 1 << 28;
        const PRI_ACTIVATE_SECONDARY: u64 = 1 << 31;
        const SEC_ENABLE_EPT: u64 = 1 << 1;
        const SEC_ENABLE_RDTSCP: u64 = 1 << 3;
        const SEC_VIRTUALIZE_X2APIC: u64 = 1 << 4;
        const SEC_ENABLE_VPID: u64 = 1 << 5;
        const SEC_UNRESTRICTED_GUEST: u64 = 1 << 7;
        const SEC_VIRTUAL_INTERRUPT_DELIVERY: u64 = 1 << 9;

        let mut pin = PIN_EXTERNAL_INTERRUPT_EXITING;
        if self.timer_scale.is_some() {
            pin |= PIN_ACTIVATE_VMX_PREEMPTION_TIMER;
        }
        vmwrite(
            vmcs::control::PINBASED_EXEC_CONTROLS,
            adjust_vmx_control(VmxControl::PinBased, pin),
        );

        vmwrite(
            vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
            adjust_vmx_control(
                VmxControl::ProcessorBased,
                PRI_HLT_EXITING
                    | PRI_INVLPG_EXITING
                    | PRI_RDTSC_EXITING
                    | PRI_CR3_LOAD_EXITING
                    | PRI_CR3_STORE_EXITING
                    | PRI_CR8_LOAD_EXITING
                    | PRI_CR8_STORE_EXITING
                    | PRI_USE_TPR_SHADOW
                    | PRI_USE_IO_BITMAPS
                    | PRI_USE_MSR_BITMAPS
                    | PRI_ACTIVATE_SECONDARY,
            ),
        );

        let secondary = adjust_vmx_control(
            VmxControl::ProcessorBased2,
            SEC_ENABLE_EPT
                | SEC_ENABLE_RDTSCP
                | SEC_VIRTUALIZE_X2APIC
                | SEC_ENABLE_VPID
                | SEC_UNRESTRICTED_GUEST
                | SEC_VIRTUAL_INTERRUPT_DELIVERY,
        );
        vmwrite(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS, secondary);

        // No exceptions are intercepted; the guest owns its IDT.
        vmwrite(vmcs::control::EXCEPTION_BITMAP, 0u64);
        vmwrite(vmcs::control::CR3_TARGET_COUNT, 0u64);

        // I/O bitmap: everything traps except the open serial and PS/2
        // ports. A set bit means interception.
        // See: 25.6.4 I/O-Bitmap Addresses
        let io_bitmap =
            unsafe { core::slice::from_raw_parts_mut(resources.io_bitmap_base as *mut u8, 0x2000) };
        io_bitmap.fill(0xff);
        for port in GUEST_OPEN_PORTS {
            io_bitmap[usize::from(port >> 3)] &= !(1 << (port & 0x7));
        }
        vmwrite(vmcs::control::IO_BITMAP_A_ADDR_FULL, resources.io_bitmap_base);
        vmwrite(
            vmcs::control::IO_BITMAP_B_ADDR_FULL,
            resources.io_bitmap_base + 0x1000,
        );

        // MSR bitmap: pass everything except writes to the x2APIC timer
        // registers; EOI writes trap only without virtual-interrupt
        // delivery.
        // See: 25.6.9 MSR-Bitmap Address
        let msr_bitmap =
            unsafe { core::slice::from_raw_parts_mut(resources.msr_bitmap_base as *mut u8, 0x1000) };
        msr_bitmap.fill(0);
        let mut trap_write = |msr: u32| {
            // Write bitmaps occupy the upper 2KB; low MSRs come first.
            let base = 2048 + if msr >= 0xc000_0000 { 1024 } else { 0 };
            let index = (msr & 0x1fff) as usize;
            msr_bitmap[base + index / 8] |= 1 << (index % 8);
        };
        trap_write(X2APIC_MSR_LVT_TIMER);
        trap_write(X2APIC_MSR_TIMER_DIVIDER);
        trap_write(X2APIC_MSR_TIMER_INITIAL_COUNT);
        if secondary & SEC_VIRTUAL_INTERRUPT_DELIVERY == 0 {
            debug!("virtual-interrupt delivery unsupported; intercepting EOI");
            trap_write(X2APIC_MSR_EOI);
        }
        vmwrite(vmcs::control::MSR_BITMAPS_ADDR_FULL, resources.msr_bitmap_base);

        vmwrite(vmcs::control::VIRT_APIC_ADDR_FULL, resources.vapic_base);
        vmwrite(vmcs::control::TPR_THRESHOLD, 0u64);
        vmwrite(vmcs::control::VPID, 1u16);
    }

    /// VM-exit to the 64-bit host with EFER saved and loaded; VM-entry into
    /// 64-bit mode with EFER loaded. No MSR load/store lists.
    fn prepare_exit_and_entry_control(&mut self) {
        const EXIT_HOST_ADDRESS_SPACE_SIZE: u64 = 1 << 9;
        const EXIT_ACK_INTERRUPT_ON_EXIT: u64 = 1 << 15;
        const EXIT_SAVE_EFER: u64 = 1 << 20;
        const EXIT_LOAD_EFER: u64 = 1 << 21;
        const ENTRY_IA32E_MODE_GUEST: u64 = 1 << 9;
        const ENTRY_LOAD_EFER: u64 = 1 << 15;

        vmwrite(
            vmcs::control::VMEXIT_CONTROLS,
            adjust_vmx_control(
                VmxControl::VmExit,
                EXIT_HOST_ADDRESS_SPACE_SIZE
                    | EXIT_ACK_INTERRUPT_ON_EXIT
                    | EXIT_SAVE_EFER
                    | EXIT_LOAD_EFER,
            ),
        );
        vmwrite(
            vmcs::control::VMENTRY_CONTROLS,
            adjust_vmx_control(VmxControl::VmEntry, ENTRY_IA32E_MODE_GUEST | ENTRY_LOAD_EFER),
        );
        vmwrite(vmcs::control::VMEXIT_MSR_STORE_COUNT, 0u32);
        vmwrite(vmcs::control::VMEXIT_MSR_LOAD_COUNT, 0u32);
        vmwrite(vmcs::control::VMENTRY_MSR_LOAD_COUNT, 0u32);
        vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, 0u32);
    }

    /// Points the EPT at the nested PML4, with the write-back memory type
    /// and a 4-level walk.
    fn prepare_nested_paging(&mut self, nested_pml4_addr: u64) {
        const EPT_POINTER_MEMORY_TYPE_WRITE_BACK: u64 = 6;
        const EPT_POINTER_PAGE_WALK_LENGTH_4: u64 = 3 << 3;
        const EPT_POINTER_ACCESSED_DIRTY: u64 = 1 << 6;

        let capabilities = rdmsr(x86::msr::IA32_VMX_EPT_VPID_CAP);
        let mut eptp =
            nested_pml4_addr | EPT_POINTER_PAGE_WALK_LENGTH_4 | EPT_POINTER_MEMORY_TYPE_WRITE_BACK;
        if capabilities & (1 << 21) != 0 {
            eptp |= EPT_POINTER_ACCESSED_DIRTY;
        }
        vmwrite(vmcs::control::EPTP_FULL, eptp);
    }

    fn read(&self, field: VmcbField) -> u64 {
        vmread(encode_field(field))
    }

    fn write(&mut self, field: VmcbField, value: u64) {
        vmwrite(encode_field(field), value);
    }

    fn registers(&self) -> &GuestRegisters {
        &self.registers
    }

    fn registers_mut(&mut self) -> &mut GuestRegisters {
        &mut self.registers
    }

    /// Executes the guest until VM-exit.
    fn run(&mut self) -> VmExitReason {
        const VMX_EXIT_REASON_EXTERNAL_INTERRUPT: u16 = 1;
        const VMX_EXIT_REASON_TRIPLE_FAULT: u16 = 2;
        const VMX_EXIT_REASON_INTERRUPT_WINDOW: u16 = 7;
        const VMX_EXIT_REASON_CPUID: u16 = 10;
        const VMX_EXIT_REASON_HLT: u16 = 12;
        const VMX_EXIT_REASON_INVLPG: u16 = 14;
        const VMX_EXIT_REASON_RDTSC: u16 = 16;
        const VMX_EXIT_REASON_VMCALL: u16 = 18;
        const VMX_EXIT_REASON_CR_ACCESS: u16 = 28;
        const VMX_EXIT_REASON_IO_INSTRUCTION: u16 = 30;
        const VMX_EXIT_REASON_RDMSR: u16 = 31;
        const VMX_EXIT_REASON_WRMSR: u16 = 32;
        const VMX_EXIT_REASON_EPT_VIOLATION: u16 = 48;
        const VMX_EXIT_REASON_VMX_PREEMPTION_TIMER: u16 = 52;

        // The guest RIP/RSP/RFLAGS live in the VMCS; the rest of the file
        // crosses the switch in `self.registers`.
        vmwrite(vmcs::guest::RIP, self.registers.rip);
        vmwrite(vmcs::guest::RSP, self.registers.rsp);
        vmwrite(vmcs::guest::RFLAGS, self.registers.rflags);

        // Rearm the preemption timer for one time slice.
        // See: 26.5.1 VMX-Preemption Timer
        if let Some(timer_scale) = self.timer_scale {
            vmwrite(
                vmcs::guest::VMX_PREEMPTION_TIMER_VALUE,
                GUEST_TIME_SLICE_IN_TSC / timer_scale,
            );
        }

        let flags = unsafe { run_vm_vmx(&mut self.registers, u64::from(self.launched)) };
        vm_succeed(RFlags::from_raw(flags)).unwrap();
        self.launched = true;

        self.registers.rip = vmread(vmcs::guest::RIP);
        self.registers.rsp = vmread(vmcs::guest::RSP);
        self.registers.rflags = vmread(vmcs::guest::RFLAGS);

        // See: Table C-1. Basic Exit Reasons
        match vmread(vmcs::ro::EXIT_REASON) as u16 {
            VMX_EXIT_REASON_EXTERNAL_INTERRUPT => VmExitReason::ExternalInterrupt,
            VMX_EXIT_REASON_TRIPLE_FAULT => VmExitReason::Shutdown(vmread(vmcs::ro::EXIT_REASON)),
            VMX_EXIT_REASON_INTERRUPT_WINDOW => VmExitReason::InterruptWindow,
            VMX_EXIT_REASON_CPUID => VmExitReason::Cpuid,
            VMX_EXIT_REASON_HLT => VmExitReason::Hlt,
            VMX_EXIT_REASON_INVLPG => VmExitReason::Invlpg,
            VMX_EXIT_REASON_RDTSC => VmExitReason::Rdtsc,
            VMX_EXIT_REASON_VMCALL => VmExitReason::Hypercall,
            // See: Table 28-3. Exit Qualification for Control-Register
            //      Accesses
            VMX_EXIT_REASON_CR_ACCESS => {
                let qualification = vmread(vmcs::ro::EXIT_QUALIFICATION);
                VmExitReason::CrAccess(CrAccessQualification {
                    register: (qualification & 0xf) as u8,
                    write: (qualification >> 4) & 0b11 == 0,
                    gpr: ((qualification >> 8) & 0xf) as u8,
                })
            }
            // See: Table 28-5. Exit Qualification for I/O Instructions
            VMX_EXIT_REASON_IO_INSTRUCTION => {
                let qualification = vmread(vmcs::ro::EXIT_QUALIFICATION);
                VmExitReason::Io(IoQualification {
                    port: (qualification >> 16) as u16,
                    write: (qualification >> 3) & 1 == 0,
                    size: ((qualification & 0b111) + 1) as u8,
                })
            }
            VMX_EXIT_REASON_RDMSR => VmExitReason::Rdmsr,
            VMX_EXIT_REASON_WRMSR => VmExitReason::Wrmsr,
            // See: Table 28-7. Exit Qualification for EPT Violations
            VMX_EXIT_REASON_EPT_VIOLATION => {
                let qualification = vmread(vmcs::ro::EXIT_QUALIFICATION);
                VmExitReason::NestedPageFault(NestedPageFaultQualification {
                    rip: self.registers.rip,
                    gpa: vmread(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL),
                    missing_translation: (qualification & 0b11_1000) == 0,
                    write_access: (qualification & 0b10) != 0,
                })
            }
            VMX_EXIT_REASON_VMX_PREEMPTION_TIMER => VmExitReason::TimerExpiration,
            _ => VmExitReason::Unexpected(vmread(vmcs::ro::EXIT_REASON)),
        }
    }

    /// Queues an external interrupt through the entry interruption field.
    /// See: 25.8.3 VM-Entry Controls for Event Injection
    fn inject_interrupt(&mut self, vector: u8) {
        const INTERRUPTION_VALID: u64 = 1 << 31;
        vmwrite(
            vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD,
            INTERRUPTION_VALID | u64::from(vector),
        );
    }

    fn interrupt_window_open(&self) -> bool {
        let interruptibility = vmread(vmcs::guest::INTERRUPTIBILITY_STATE);
        let rflags = RFlags::from_raw(self.registers.rflags);
        rflags.contains(RFlags::FLAGS_IF) && interruptibility == 0
    }

    fn request_interrupt_window_exit(&mut self, enable: bool) {
        const PRI_INTERRUPT_WINDOW_EXITING: u64 = 1 << 2;
        let mut controls = vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS);
        if enable {
            controls |= PRI_INTERRUPT_WINDOW_EXITING;
        } else {
            controls &= !PRI_INTERRUPT_WINDOW_EXITING;
        }
        vmwrite(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, controls);
    }

    fn advance_rip(&mut self) {
        self.registers.rip += vmread(vmcs::ro::VMEXIT_INSTRUCTION_LEN);
        vmwrite(vmcs::guest::RIP, self.registers.rip);
    }

    /// Invalidates EPT-derived mappings for this guest.
    fn invalidate_caches(&mut self) {
        // See: 29.4.3.1 Operations that Invalidate Cached Mappings
        invept(InveptType::SingleContext, vmread(vmcs::control::EPTP_FULL));
    }

    /// Gets a flag value to be set to nested paging structure entries for
    /// the given entry types (eg, permissions).
    fn nps_entry_flags(
        &self,
        entry_type: NestedPagingStructureEntryType,
    ) -> NestedPagingStructureEntryFlags {
        // See: Table 29-6. Format of an EPT Page-Table Entry that Maps a
        //      4-KByte Page
        match entry_type {
            NestedPagingStructureEntryType::Rwx => NestedPagingStructureEntryFlags {
                permission: 0b111,
                memory_type: 0,
            },
            NestedPagingStructureEntryType::RwxWriteBack => NestedPagingStructureEntryFlags {
                permission: 0b111,
                memory_type: 6,
            },
            NestedPagingStructureEntryType::RxWriteBack => NestedPagingStructureEntryFlags {
                permission: 0b101,
                memory_type: 6,
            },
        }
    }
}

const PIN_ACTIVATE_VMX_PREEMPTION_TIMER: u64 = 1 << 6;

impl Vmx {
    pub(crate) fn new() -> Self {
        /// Returns the scale value to convert TSC to the unit the
        /// VMX-preemption timer counts in, when the timer exists.
        fn vmx_preemption_timer_scale() -> Option<u64> {
            if (adjust_vmx_control(VmxControl::PinBased, PIN_ACTIVATE_VMX_PREEMPTION_TIMER)
                & PIN_ACTIVATE_VMX_PREEMPTION_TIMER)
                == 0
            {
                warn!("VMX-preemption timer not available; guest hangs are unbounded");
                None
            } else {
                const IA32_VMX_MISC_PREEMPTION_TIMER_TSC_RELATIONSHIP_MASK: u64 = 0b11111;

                let bit_position = rdmsr(x86::msr::IA32_VMX_MISC)
                    & IA32_VMX_MISC_PREEMPTION_TIMER_TSC_RELATIONSHIP_MASK;
                Some(1 << bit_position)
            }
        }

        let vmxon_region = unsafe { Box::<Vmxon>::new_zeroed().assume_init() };
        let vmcs_region = unsafe { Box::<Vmcs>::new_zeroed().assume_init() };
        Self {
            vmxon_region,
            vmcs_region,
            timer_scale: vmx_preemption_timer_scale(),
            ..Default::default()
        }
    }
}

/// Maps logical field names to VMCS encodings.
fn encode_field(field: VmcbField) -> u32 {
    match field {
        VmcbField::GuestRip => vmcs::guest::RIP,
        VmcbField::GuestRsp => vmcs::guest::RSP,
        VmcbField::GuestRflags => vmcs::guest::RFLAGS,
        VmcbField::GuestCr0 => vmcs::guest::CR0,
        VmcbField::GuestCr3 => vmcs::guest::CR3,
        VmcbField::GuestCr4 => vmcs::guest::CR4,
        // The TPR lives in the virtual-APIC page; expose the threshold
        // field as the nearest logical equivalent.
        VmcbField::GuestCr8 => vmcs::control::TPR_THRESHOLD,
        VmcbField::GuestEfer => vmcs::guest::IA32_EFER_FULL,
        VmcbField::GuestGdtrBase => vmcs::guest::GDTR_BASE,
        VmcbField::GuestIdtrBase => vmcs::guest::IDTR_BASE,
        VmcbField::TscOffset => vmcs::control::TSC_OFFSET_FULL,
        VmcbField::ExitReason => vmcs::ro::EXIT_REASON,
        VmcbField::ExitQualification => vmcs::ro::EXIT_QUALIFICATION,
        VmcbField::ExitInfo2 => vmcs::ro::GUEST_PHYSICAL_ADDR_FULL,
        VmcbField::ExitInterruptionInfo => vmcs::ro::VMEXIT_INTERRUPTION_INFO,
    }
}

/// The region of memory that the logical processor uses to support VMX
/// operation.
///
/// See: 25.11.5 VMXON Region
#[derive(derivative::Derivative)]
#[derivative(Default)]
#[repr(C, align(4096))]
struct Vmxon {
    revision_id: u32,
    #[derivative(Default(value = "[0; 4092]"))]
    data: [u8; 4092],
}
const _: () = assert!(size_of::<Vmxon>() == 0x1000);

/// The region of memory that the logical processor uses to represent a
/// virtual CPU. Called virtual-machine control data structure (VMCS).
///
/// See: 25.2 FORMAT OF THE VMCS REGION
#[derive(derivative::Derivative)]
#[derivative(Default)]
#[repr(C, align(4096))]
struct Vmcs {
    revision_id: u32,
    abort_indicator: u32,
    #[derivative(Default(value = "[0; 4088]"))]
    data: [u8; 4088],
}
const _: () = assert!(size_of::<Vmcs>() == 0x1000);

/// The types of the control field.
#[derive(Clone, Copy)]
enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

/// The type of invalidation the INVEPT instruction performs.
///
/// See: 29.4.3.1 Operations that Invalidate Cached Mappings
#[repr(u64)]
enum InveptType {
    SingleContext = 1,
}

/// The structure to specify the effect of the INVEPT instruction.
///
/// See: Figure 31-1. INVEPT Descriptor
#[repr(C)]
struct InveptDescriptor {
    eptp: u64,
    _reserved: u64,
}
const _: () = assert!(size_of::<InveptDescriptor>() == 16);

/// The collection of GDT related data needed to manage the host GDT.
#[repr(C, align(16))]
struct HostGdt {
    gdt: Vec<u64>,
    gdtr: DescriptorTablePointer<u64>,
    tss: TaskStateSegment,
    tr: SegmentSelector,
    cs: SegmentSelector,
}
const _: () = assert!((size_of::<HostGdt>() % 0x10) == 0);

impl HostGdt {
    /// Initializes the host GDT from the current GDT.
    ///
    /// On the UEFI DXE phase, the Task Register (TR) is zero, which does not
    /// satisfy requirements as host state. To work around this, this
    /// function makes a clone of the current GDT, adds a TSS, and
    /// initializes TR and GDTR with the clone to be used as host state.
    ///
    /// "The selector fields for CS and TR cannot be 0000H."
    /// See: 27.2.3 Checks on Host Segment and Descriptor-Table Registers
    fn initialize_from_current(&mut self) {
        let mut current_gdtr = DescriptorTablePointer::<u64>::default();
        sgdt(&mut current_gdtr);
        let current_gdt = unsafe {
            core::slice::from_raw_parts(
                current_gdtr.base.cast::<u64>(),
                usize::from(current_gdtr.limit + 1) / 8,
            )
        };
        self.gdt = current_gdt.to_vec();
        self.gdt.push(task_segment_descriptor(&self.tss));

        self.gdtr.base = self.gdt.as_ptr();
        self.gdtr.limit = u16::try_from(self.gdt.len() * 8 - 1).unwrap();

        let tr_index = self.gdt.len() as u16 - 1;
        self.tr = SegmentSelector::new(tr_index, x86::Ring::Ring0);
        self.cs = x86::segmentation::cs();
    }
}

impl Default for HostGdt {
    fn default() -> Self {
        Self {
            gdt: Vec::new(),
            gdtr: DescriptorTablePointer::<u64>::default(),
            tss: TaskStateSegment([0; 104]),
            tr: SegmentSelector::from_raw(0),
            cs: SegmentSelector::from_raw(0),
        }
    }
}

/// See: Figure 8-11. 64-Bit TSS Format
struct TaskStateSegment([u8; 104]);

/// Builds a segment descriptor from the task state segment.
fn task_segment_descriptor(tss: &TaskStateSegment) -> u64 {
    let tss_size = size_of::<TaskStateSegment>() as u64;
    let tss_base = core::ptr::from_ref::<TaskStateSegment>(tss) as u64;
    let tss_descriptor = <DescriptorBuilder as GateDescriptorBuilder<u32>>::tss_descriptor(
        tss_base,
        tss_size - 1,
        true,
    )
    .present()
    .dpl(x86::Ring::Ring0)
    .finish();
    unsafe { core::mem::transmute::<Descriptor, u64>(tss_descriptor) }
}

/// Returns an adjusted value for the control field according to the
/// capability MSR: bits that must be one are set, bits that must be zero
/// are cleared.
///
/// See: A.3.1 Pin-Based VM-Execution Controls
fn adjust_vmx_control(control: VmxControl, requested_value: u64) -> u64 {
    const IA32_VMX_BASIC_VMX_CONTROLS_FLAG: u64 = 1 << 55;

    let vmx_basic = rdmsr(x86::msr::IA32_VMX_BASIC);
    let true_cap_msr_supported = (vmx_basic & IA32_VMX_BASIC_VMX_CONTROLS_FLAG) != 0;

    let cap_msr = match (control, true_cap_msr_supported) {
        (VmxControl::PinBased, true) => x86::msr::IA32_VMX_TRUE_PINBASED_CTLS,
        (VmxControl::PinBased, false) => x86::msr::IA32_VMX_PINBASED_CTLS,
        (VmxControl::ProcessorBased, true) => x86::msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        (VmxControl::ProcessorBased, false) => x86::msr::IA32_VMX_PROCBASED_CTLS,
        (VmxControl::VmExit, true) => x86::msr::IA32_VMX_TRUE_EXIT_CTLS,
        (VmxControl::VmExit, false) => x86::msr::IA32_VMX_EXIT_CTLS,
        (VmxControl::VmEntry, true) => x86::msr::IA32_VMX_TRUE_ENTRY_CTLS,
        (VmxControl::VmEntry, false) => x86::msr::IA32_VMX_ENTRY_CTLS,
        // There is no TRUE MSR for IA32_VMX_PROCBASED_CTLS2.
        (VmxControl::ProcessorBased2, _) => x86::msr::IA32_VMX_PROCBASED_CTLS2,
    };

    let capabilities = rdmsr(cap_msr);
    let allowed0 = capabilities as u32;
    let allowed1 = (capabilities >> 32) as u32;
    let mut effective_value = u32::try_from(requested_value).unwrap();
    effective_value |= allowed0;
    effective_value &= allowed1;
    u64::from(effective_value)
}

/// Updates the `IA32_FEATURE_CONTROL` MSR to satisfy the requirement for
/// entering VMX operation.
fn adjust_feature_control_msr() {
    const IA32_FEATURE_CONTROL_LOCK_BIT_FLAG: u64 = 1 << 0;
    const IA32_FEATURE_CONTROL_ENABLE_VMX_OUTSIDE_SMX_FLAG: u64 = 1 << 2;

    // If the lock bit is cleared, set it along with the VMXON-outside-SMX
    // operation bit. Without those two bits, the VMXON instruction fails.
    // See: 24.7 ENABLING AND ENTERING VMX OPERATION
    let feature_control = rdmsr(x86::msr::IA32_FEATURE_CONTROL);
    if (feature_control & IA32_FEATURE_CONTROL_LOCK_BIT_FLAG) == 0 {
        wrmsr(
            x86::msr::IA32_FEATURE_CONTROL,
            feature_control
                | IA32_FEATURE_CONTROL_ENABLE_VMX_OUTSIDE_SMX_FLAG
                | IA32_FEATURE_CONTROL_LOCK_BIT_FLAG,
        );
    }
}

/// Updates the CR0 to satisfy the requirement for entering VMX operation.
///
/// See: A.7 VMX-FIXED BITS IN CR0
fn adjust_cr0() {
    let fixed0cr0 = rdmsr(x86::msr::IA32_VMX_CR0_FIXED0);
    let fixed1cr0 = rdmsr(x86::msr::IA32_VMX_CR0_FIXED1);
    let mut new_cr0 = cr0().bits() as u64;
    new_cr0 &= fixed1cr0;
    new_cr0 |= fixed0cr0;
    let new_cr0 = Cr0::from_bits_truncate(new_cr0 as usize);
    cr0_write(new_cr0);
}

extern "efiapi" {
    /// Runs the guest until VM-exit occurs. Returns the RFLAGS of the
    /// failed VMLAUNCH/VMRESUME, or the (cleared) post-exit RFLAGS.
    fn run_vm_vmx(registers: &mut GuestRegisters, launched: u64) -> u64;
}
global_asm!(include_str!("vmx_run_vm.S"));

/// The wrapper of the VMXON instruction.
fn vmxon(vmxon_region: &mut Vmxon) {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::bits64::vmx::vmxon(addr_of_mut!(*vmxon_region) as u64).unwrap() };
}

/// The wrapper of the VMCLEAR instruction.
fn vmclear(vmcs_region: &mut Vmcs) {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::bits64::vmx::vmclear(addr_of_mut!(*vmcs_region) as u64).unwrap() };
}

/// The wrapper of the VMPTRLD instruction.
fn vmptrld(vmcs_region: &mut Vmcs) {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::bits64::vmx::vmptrld(addr_of_mut!(*vmcs_region) as u64).unwrap() }
}

/// The wrapper of the VMREAD instruction. Returns zero on error.
fn vmread(field: u32) -> u64 {
    // Safety: this kernel runs at CPL0.
    unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or(0)
}

/// The wrapper of the VMWRITE instruction.
fn vmwrite<T: Into<u64>>(field: u32, val: T)
where
    u64: From<T>,
{
    // Safety: this kernel runs at CPL0.
    unsafe { x86::bits64::vmx::vmwrite(field, u64::from(val)) }.unwrap();
}

/// The wrapper of the INVEPT instruction.
///
/// See: INVEPT - Invalidate Translations Derived from EPT
fn invept(invalidation: InveptType, eptp: u64) {
    let descriptor = InveptDescriptor { eptp, _reserved: 0 };
    let flags = unsafe {
        let flags: u64;
        asm!(
            "invept {}, [{}]",
            "pushfq",
            "pop {}",
            in(reg) invalidation as u64,
            in(reg) &descriptor,
            lateout(reg) flags
        );
        flags
    };
    if let Err(err) = vm_succeed(RFlags::from_raw(flags)) {
        panic!("{err}");
    }
}

/// Checks that the latest VMX instruction succeeded.
///
/// See: 31.2 CONVENTIONS
fn vm_succeed(flags: RFlags) -> Result<(), String> {
    if flags.contains(RFlags::FLAGS_ZF) {
        // See: 31.4 VM INSTRUCTION ERROR NUMBERS
        Err(format!(
            "VmFailValid with {}",
            vmread(vmcs::ro::VM_INSTRUCTION_ERROR)
        ))
    } else if flags.contains(RFlags::FLAGS_CF) {
        Err("VmFailInvalid".to_string())
    } else {
        Ok(())
    }
}

impl fmt::Debug for Vmcs {
    fn fmt(&self, format: &mut fmt::Formatter<'_>) -> fmt::Result {
        // An abbreviated dump of what matters when an entry or an exit goes
        // wrong. Only valid while this VMCS is current.
        format
            .debug_struct("Vmcs")
            .field("Revision ID", &self.revision_id)
            .field("Guest RIP", &vmread(vmcs::guest::RIP))
            .field("Guest RSP", &vmread(vmcs::guest::RSP))
            .field("Guest RFLAGS", &vmread(vmcs::guest::RFLAGS))
            .field("Guest CR0", &vmread(vmcs::guest::CR0))
            .field("Guest CR3", &vmread(vmcs::guest::CR3))
            .field("Guest CR4", &vmread(vmcs::guest::CR4))
            .field("Guest EFER", &vmread(vmcs::guest::IA32_EFER_FULL))
            .field("Guest CS", &vmread(vmcs::guest::CS_SELECTOR))
            .field(
                "Guest interruptibility",
                &vmread(vmcs::guest::INTERRUPTIBILITY_STATE),
            )
            .field("Host CR3", &vmread(vmcs::host::CR3))
            .field("Host RIP", &vmread(vmcs::host::RIP))
            .field(
                "Pin-based controls",
                &vmread(vmcs::control::PINBASED_EXEC_CONTROLS),
            )
            .field(
                "Primary processor-based controls",
                &vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS),
            )
            .field(
                "Secondary processor-based controls",
                &vmread(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS),
            )
            .field("EPT pointer", &vmread(vmcs::control::EPTP_FULL))
            .field("Exit reason", &vmread(vmcs::ro::EXIT_REASON))
            .field(
                "Exit qualification",
                &vmread(vmcs::ro::EXIT_QUALIFICATION),
            )
            .field(
                "VM-instruction error",
                &vmread(vmcs::ro::VM_INSTRUCTION_ERROR),
            )
            .finish_non_exhaustive()
    }
}
