//! The module containing vendor agnostic representation of HW VT
//! (hardware-assisted virtualization technology) related definitions.
//!
//! Both back-ends expose the same control surface: staged preparation of
//! host state, guest state, execution controls and exit/entry controls,
//! logical field access into the vendor control block, event injection and
//! the world switch itself.

pub(crate) mod svm;
pub(crate) mod vmx;

use bitfield::bitfield;
use core::fmt;
use x86::current::paging::{BASE_PAGE_SHIFT, PAGE_SIZE_ENTRIES};

/// This trait represents an interface to enable HW VT, set up and run a
/// single virtual machine instance on the current processor.
pub(crate) trait HardwareVt: fmt::Debug {
    /// The hardware's required control-block version stamp.
    fn revision_id(&self) -> u32;

    /// Enables HW VT on the current processor. It has to be called exactly
    /// once before calling any other method.
    fn enable(&mut self);

    /// Programs the host state loaded on every VM exit.
    fn prepare_host_state(&mut self);

    /// Programs the guest's initial architectural state from the linked
    /// program layout.
    fn prepare_guest_state(&mut self, layout: &GuestLayout);

    /// Programs interception policy; `resources` carries the VM-owned
    /// bitmap and vAPIC frames the policy points into.
    fn prepare_execution_control(&mut self, resources: &ExecutionResources);

    /// Programs VM-exit and VM-entry controls (64-bit entry, EFER
    /// save/load).
    fn prepare_exit_and_entry_control(&mut self);

    /// Enables nested paging rooted at `nested_pml4_addr`.
    fn prepare_nested_paging(&mut self, nested_pml4_addr: u64);

    /// Reads a logical field from the control block.
    fn read(&self, field: VmcbField) -> u64;

    /// Writes a logical field of the control block.
    fn write(&mut self, field: VmcbField, value: u64);

    /// The guest general-purpose register save area.
    fn registers(&self) -> &GuestRegisters;
    fn registers_mut(&mut self) -> &mut GuestRegisters;

    /// Executes the guest until it triggers VM exit.
    fn run(&mut self) -> VmExitReason;

    /// Queues an external-interrupt event for the next VM entry.
    fn inject_interrupt(&mut self, vector: u8);

    /// True when the guest can accept an external interrupt right now.
    fn interrupt_window_open(&self) -> bool;

    /// Asks for a VM exit as soon as the guest interrupt window opens.
    fn request_interrupt_window_exit(&mut self, enable: bool);

    /// Moves the guest past the instruction that caused the current exit.
    fn advance_rip(&mut self);

    /// Invalidates caches of the nested paging structures.
    fn invalidate_caches(&mut self);

    /// Gets a flag value to be set to nested paging structure entries for
    /// the given entry types (eg, permissions).
    fn nps_entry_flags(
        &self,
        entry_type: NestedPagingStructureEntryType,
    ) -> NestedPagingStructureEntryFlags;
}

/// Logical control-block field names, mapped to VMCS encodings on Intel and
/// VMCB offsets on AMD.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum VmcbField {
    GuestRip,
    GuestRsp,
    GuestRflags,
    GuestCr0,
    GuestCr3,
    GuestCr4,
    GuestCr8,
    GuestEfer,
    GuestGdtrBase,
    GuestIdtrBase,
    TscOffset,
    ExitReason,
    ExitQualification,
    ExitInfo2,
    /// Details of the vectored event that caused the exit (bit 31 valid,
    /// bits 7:0 vector).
    ExitInterruptionInfo,
}

/// The initial guest layout handed over by the linker: where execution
/// starts, the page table root, and the fixed descriptor-table addresses.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct GuestLayout {
    /// Initial RIP; the program header's virtual address.
    pub(crate) rip: u64,
    /// Initial RDI; the trampoline reads the header through it.
    pub(crate) rdi: u64,
    /// Guest CR3: physical address of the program page table.
    pub(crate) cr3: u64,
    pub(crate) gdtr_base: u64,
    pub(crate) gdtr_limit: u64,
    pub(crate) idtr_base: u64,
    pub(crate) idtr_limit: u64,
    pub(crate) tr_base: u64,
    pub(crate) tr_limit: u64,
}

/// Physical addresses of the VM-owned, zeroed frames the execution
/// controls point into. Each back-end fills them in its own format.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ExecutionResources {
    /// Three pages covering ports 0x0000-0xffff (Intel uses two).
    pub(crate) io_bitmap_base: u64,
    /// Two pages of MSR permission bits.
    pub(crate) msr_bitmap_base: u64,
    /// One page backing the virtual APIC.
    pub(crate) vapic_base: u64,
}

/// I/O ports the guest accesses without interception: COM1 and the PS/2
/// controller.
pub(crate) const GUEST_OPEN_PORTS: [u16; 8] =
    [0x3f8, 0x3f9, 0x3fa, 0x3fb, 0x3fc, 0x3fd, 0x60, 0x64];

/// x2APIC MSRs whose writes are always intercepted: timer LVT, divide
/// configuration and initial count.
pub(crate) const X2APIC_MSR_LVT_TIMER: u32 = 0x832;
pub(crate) const X2APIC_MSR_TIMER_INITIAL_COUNT: u32 = 0x838;
pub(crate) const X2APIC_MSR_TIMER_DIVIDER: u32 = 0x83e;
/// EOI, intercepted only without virtual-interrupt delivery.
pub(crate) const X2APIC_MSR_EOI: u32 = 0x80b;
pub(crate) const X2APIC_MSR_TPR: u32 = 0x808;
pub(crate) const X2APIC_MSR_CURRENT_COUNT: u32 = 0x839;

/// Reasons of VM exit, already decoded from the vendor exit code.
pub(crate) enum VmExitReason {
    Cpuid,
    Hlt,
    Rdmsr,
    Wrmsr,
    Rdtsc,
    Invlpg,
    /// IN/OUT. Qualification carries port, direction and access size.
    Io(IoQualification),
    /// Guest CR3/CR8 read or write through the intercepted paths.
    CrAccess(CrAccessQualification),
    /// vmcall on Intel, vmmcall on AMD.
    Hypercall,
    /// An address translation failure with nested paging.
    NestedPageFault(NestedPageFaultQualification),
    /// An external interrupt arrived while the guest ran.
    ExternalInterrupt,
    /// The guest interrupt window opened after a requested exit.
    InterruptWindow,
    /// The preemption timer (Intel) or the pause filter (AMD) fired.
    TimerExpiration,
    /// The logical processor entered the shutdown state, eg, triple fault.
    Shutdown(u64),
    /// An unhandled VM exit happened. Contains a vendor specific VM exit
    /// code.
    Unexpected(u64),
}

/// Details of an intercepted IN/OUT.
#[derive(Clone, Copy, Debug)]
pub(crate) struct IoQualification {
    pub(crate) port: u16,
    pub(crate) write: bool,
    /// Access width in bytes: 1, 2 or 4.
    pub(crate) size: u8,
}

/// Details of an intercepted control-register access.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CrAccessQualification {
    /// 3 or 8.
    pub(crate) register: u8,
    pub(crate) write: bool,
    /// General-purpose register index in the canonical order
    /// RAX,RCX,RDX,RBX,RSP,RBP,RSI,RDI,R8..R15.
    pub(crate) gpr: u8,
}

/// Details of the cause of nested page fault.
#[derive(Debug)]
pub(crate) struct NestedPageFaultQualification {
    pub(crate) rip: u64,
    pub(crate) gpa: u64,
    pub(crate) missing_translation: bool,
    pub(crate) write_access: bool,
}

/// The collection of the guest general purpose register values, plus the
/// state only software can carry across the world switch. The assembly
/// trampolines index this structure; the layout is load-bearing.
#[derive(Clone, derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C, align(16))]
pub(crate) struct GuestRegisters {
    pub(crate) rax: u64,    // +0x00
    pub(crate) rbx: u64,    // +0x08
    pub(crate) rcx: u64,    // +0x10
    pub(crate) rdx: u64,    // +0x18
    pub(crate) rdi: u64,    // +0x20
    pub(crate) rsi: u64,    // +0x28
    pub(crate) rbp: u64,    // +0x30
    pub(crate) r8: u64,     // +0x38
    pub(crate) r9: u64,     // +0x40
    pub(crate) r10: u64,    // +0x48
    pub(crate) r11: u64,    // +0x50
    pub(crate) r12: u64,    // +0x58
    pub(crate) r13: u64,    // +0x60
    pub(crate) r14: u64,    // +0x68
    pub(crate) r15: u64,    // +0x70
    pub(crate) rip: u64,    // +0x78
    pub(crate) rsp: u64,    // +0x80
    pub(crate) rflags: u64, // +0x88
    pub(crate) cr2: u64,    // +0x90
    #[derivative(Debug = "ignore")]
    pub(crate) _pad: u64, // +0x98
    /// FXSAVE image, saved and restored around the world switch.
    #[derivative(Debug = "ignore", Default(value = "[0; 512]"))]
    pub(crate) fxsave: [u8; 512], // +0xa0
}
const _: () = assert!(core::mem::offset_of!(GuestRegisters, fxsave) == 0xa0);

/// Reads the guest GPR selected by a CR-access qualification index.
pub(crate) fn gpr_read(registers: &GuestRegisters, gpr: u8) -> u64 {
    match gpr {
        0 => registers.rax,
        1 => registers.rcx,
        2 => registers.rdx,
        3 => registers.rbx,
        4 => registers.rsp,
        5 => registers.rbp,
        6 => registers.rsi,
        7 => registers.rdi,
        8 => registers.r8,
        9 => registers.r9,
        10 => registers.r10,
        11 => registers.r11,
        12 => registers.r12,
        13 => registers.r13,
        14 => registers.r14,
        _ => registers.r15,
    }
}

/// Writes the guest GPR selected by a CR-access qualification index.
pub(crate) fn gpr_write(registers: &mut GuestRegisters, gpr: u8, value: u64) {
    match gpr {
        0 => registers.rax = value,
        1 => registers.rcx = value,
        2 => registers.rdx = value,
        3 => registers.rbx = value,
        4 => registers.rsp = value,
        5 => registers.rbp = value,
        6 => registers.rsi = value,
        7 => registers.rdi = value,
        8 => registers.r8 = value,
        9 => registers.r9 = value,
        10 => registers.r10 = value,
        11 => registers.r11 = value,
        12 => registers.r12 = value,
        13 => registers.r13 = value,
        14 => registers.r14 = value,
        _ => registers.r15 = value,
    }
}

/// Permissions and memory types to be specified for nested paging structure
/// entries.
pub(crate) enum NestedPagingStructureEntryType {
    /// Readable, writable, executable.
    Rwx,

    /// Readable, writable, executable, with the write-back memory type.
    RwxWriteBack,

    /// Readable, NON writable, executable, with the write-back memory type.
    RxWriteBack,
}

/// The values used to initialize [`NestedPagingStructureEntry`].
#[derive(Clone, Copy)]
pub(crate) struct NestedPagingStructureEntryFlags {
    pub(crate) permission: u8,
    pub(crate) memory_type: u8,
}

/// A single nested paging structure.
///
/// This is an extended page table on Intel and a nested page table on AMD.
/// The details of the layout are not represented in this structure so that
/// it may be used for any of the structures (PML4, PDPT, PD and PT) across
/// platforms.
#[derive(Clone, Copy, Debug)]
#[repr(C, align(4096))]
pub(crate) struct NestedPagingStructure {
    /// An array of nested paging structure entries (8 bytes, 512 entries).
    pub(crate) entries: [NestedPagingStructureEntry; PAGE_SIZE_ENTRIES],
}
const _: () = assert!(size_of::<NestedPagingStructure>() == 0x1000);

bitfield! {
    /// Platform independent representation of a nested paging structure entry.
    ///
    /// Because it is platform independent, the layout is not exactly correct.
    /// For example, bit 5:3 `memory_type` exists only on Intel. On AMD, those
    /// are other bits and we set zeros.
    /*
         66665 5     1 110000 000 000
         32109 8.....2 109876 543 210
        +-----+-------+------+---+---+
        |xxxxx|  PFN  |xxxxxx| M | P |
        +-----+-------+------+---+---+
    */
    #[derive(Clone, Copy)]
    pub struct NestedPagingStructureEntry(u64);
    impl Debug;
    permission, set_permission: 2, 0;
    memory_type, set_memory_type: 5, 3;
    flags1, _: 11, 6;
    pub pfn, set_pfn: 58, 12;
    flags2, _: 63, 59;
}

impl NestedPagingStructureEntry {
    /// Returns the next nested paging structures.
    pub(crate) fn next_table_mut(&mut self) -> &mut NestedPagingStructure {
        let next_table_addr = self.pfn() << BASE_PAGE_SHIFT;
        assert!(next_table_addr != 0);
        let next_table_ptr = next_table_addr as *mut NestedPagingStructure;
        unsafe { next_table_ptr.as_mut() }.unwrap()
    }

    /// Sets the address of the next nested paging structure or final
    /// physical address with permissions specified by `flags`.
    pub(crate) fn set_translation(&mut self, pa: u64, flags: NestedPagingStructureEntryFlags) {
        self.set_pfn(pa >> BASE_PAGE_SHIFT);
        self.set_permission(u64::from(flags.permission));
        self.set_memory_type(u64::from(flags.memory_type));
    }
}

/// Builds a flat 64-bit GDT image for the guest: null, code, data, TSS.
/// Selector assignments match what the guest state preparation installs.
pub(crate) fn guest_gdt_image(tr_base: u64) -> [u64; 6] {
    const CODE64: u64 = 0x00af_9b00_0000_ffff;
    const DATA64: u64 = 0x00cf_9300_0000_ffff;
    // 64-bit TSS descriptor occupies two slots.
    let tss_low = 0x0000_8900_0000_0067u64
        | ((tr_base & 0xff_ffff) << 16)
        | (((tr_base >> 24) & 0xff) << 56);
    let tss_high = tr_base >> 32;
    [0, CODE64, DATA64, 0, tss_low, tss_high]
}

/// Guest selector values corresponding to [`guest_gdt_image`].
pub(crate) const GUEST_CS_SELECTOR: u16 = 0x08;
pub(crate) const GUEST_DS_SELECTOR: u16 = 0x10;
pub(crate) const GUEST_TR_SELECTOR: u16 = 0x20;
