//! The module containing high-level execution flow of this kernel: the
//! hypervisor state singleton, VM creation and teardown, and the vmexit
//! dispatch loop with its emulation handlers.
//!
//! Every exit-dispatch branch resolves to one of four outcomes (resume,
//! inject, terminal, fatal) and the top-level loop is a single match on
//! that outcome; there is no out-of-band control flow across the vmexit
//! boundary.

use crate::{
    config::DEFAULT_RDTSC_PER_TIMER_TICK,
    deploy,
    disk::BootBlockIo,
    frame,
    hardware_vt::{
        gpr_read, gpr_write, CrAccessQualification, GuestRegisters, IoQualification,
        NestedPageFaultQualification, VmExitReason, VmcbField, X2APIC_MSR_CURRENT_COUNT,
        X2APIC_MSR_EOI, X2APIC_MSR_LVT_TIMER, X2APIC_MSR_TIMER_DIVIDER,
        X2APIC_MSR_TIMER_INITIAL_COUNT, X2APIC_MSR_TPR,
    },
    ipc::{Hypercall, VmChannels},
    vm::Vm,
    x86_instructions::{cpuid, cpu_vendor, inb, inl, inw, outb, outl, outw, rdmsr, rdtsc},
};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{debug, error, info, trace, warn};
use spin::Mutex;
use stonelink::db::{Db, DbError};
use stonelink::linker::LinkerError;

/// Errors of the VM lifecycle. A failed create never hands a partial image
/// to the dispatch loop.
#[derive(Debug)]
pub(crate) enum VmError {
    Unsupported,
    OutOfMemory,
    Linker(LinkerError),
    Db(DbError),
    Image(stonelink::image::ImageError),
    Paging(stonelink::paging::PagingError),
}

impl From<LinkerError> for VmError {
    fn from(err: LinkerError) -> Self {
        VmError::Linker(err)
    }
}

impl From<DbError> for VmError {
    fn from(err: DbError) -> Self {
        VmError::Db(err)
    }
}

impl From<stonelink::image::ImageError> for VmError {
    fn from(err: stonelink::image::ImageError) -> Self {
        VmError::Image(err)
    }
}

impl From<stonelink::paging::PagingError> for VmError {
    fn from(err: stonelink::paging::PagingError) -> Self {
        VmError::Paging(err)
    }
}

/// The singleton owning everything shared across VMs: the VM list, the
/// vector routing table, the module database and the timer calibration.
/// Constructed once by [`init`] and passed by reference everywhere.
pub(crate) struct HypervisorState {
    vm_list: Mutex<Vec<Weak<VmChannels>>>,
    /// One slot per interrupt vector, each holding the VMs routed to it.
    /// Slots lock independently.
    vector_routes: [Mutex<Vec<Weak<VmChannels>>>; 256],
    next_vm_id: AtomicU64,
    rdtsc_per_tick: AtomicU64,
    db: Mutex<Option<Db<BootBlockIo>>>,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_ROUTE: Mutex<Vec<Weak<VmChannels>>> = Mutex::new(Vec::new());

static HYPERVISOR_STATE: HypervisorState = HypervisorState {
    vm_list: Mutex::new(Vec::new()),
    vector_routes: [EMPTY_ROUTE; 256],
    next_vm_id: AtomicU64::new(1),
    rdtsc_per_tick: AtomicU64::new(DEFAULT_RDTSC_PER_TIMER_TICK),
    db: Mutex::new(None),
};

pub(crate) fn hypervisor_state() -> &'static HypervisorState {
    &HYPERVISOR_STATE
}

impl HypervisorState {
    pub(crate) fn rdtsc_per_tick(&self) -> u64 {
        self.rdtsc_per_tick.load(Ordering::Relaxed)
    }

    /// Runs `operation` with the module database. The database is shared by
    /// every processor that deploys or dynamically loads modules.
    pub(crate) fn with_db<R>(
        &self,
        operation: impl FnOnce(&mut Db<BootBlockIo>) -> R,
    ) -> Option<R> {
        let mut guard = self.db.lock();
        guard.as_mut().map(operation)
    }

    /// Registers a VM for one interrupt vector; external interrupts on it
    /// fan out to the queue of every routed VM.
    pub(crate) fn attach_vector(&self, vm: &mut Vm, vector: u8) {
        self.vector_routes[usize::from(vector)]
            .lock()
            .push(Arc::downgrade(&vm.channels));
        vm.mapped_vectors.push(vector);
        debug!("VM {} routed to vector {vector:#x}", vm.id);
    }

    /// Removes a VM from every vector it was routed to. Runs before frame
    /// release on teardown.
    pub(crate) fn detach_vectors(&self, vm: &mut Vm) {
        for vector in core::mem::take(&mut vm.mapped_vectors) {
            self.vector_routes[usize::from(vector)]
                .lock()
                .retain(|routed| {
                    routed
                        .upgrade()
                        .is_some_and(|channels| !Arc::ptr_eq(&channels, &vm.channels))
                });
        }
    }

    /// Delivers an external interrupt to every VM routed for `vector`, in
    /// enqueue order per VM.
    pub(crate) fn route_external_interrupt(&self, vector: u8) {
        for routed in self.vector_routes[usize::from(vector)].lock().iter() {
            if let Some(channels) = routed.upgrade() {
                channels.interrupts.push(vector);
            }
        }
    }

    /// Advances the virtual timer of every live VM against the host TSC.
    pub(crate) fn notify_timers(&self) {
        let now = rdtsc();
        let per_tick = self.rdtsc_per_tick();
        self.vm_list.lock().retain(|entry| {
            if let Some(channels) = entry.upgrade() {
                channels.notify_timer(now, per_tick);
                true
            } else {
                false
            }
        });
    }
}

/// Verifies hardware support and takes ownership of the module database.
pub(crate) fn init(db: Db<BootBlockIo>) -> Result<(), VmError> {
    const CPUID_VMX_BIT: u32 = 1 << 5;
    const CPUID_SVM_BIT: u32 = 1 << 2;

    let supported = if &cpu_vendor() == b"GenuineIntel" {
        cpuid(0x1, 0).ecx & CPUID_VMX_BIT != 0
    } else {
        cpuid(0x8000_0001, 0).ecx & CPUID_SVM_BIT != 0
    };
    if !supported {
        error!("hardware virtualization not supported on this processor");
        return Err(VmError::Unsupported);
    }
    *HYPERVISOR_STATE.db.lock() = Some(db);
    Ok(())
}

/// What a finished VM left behind: the exit class and the last saved guest
/// register file.
pub(crate) struct ExitSummary {
    pub(crate) clean: bool,
    pub(crate) registers: GuestRegisters,
}

/// Creates a VM running the program whose entry point is
/// `entry_point_name`, supervises it to its terminal exit, and tears it
/// down. Frames release in reverse allocation order on every path.
pub(crate) fn vm_create(entry_point_name: &str) -> Result<ExitSummary, VmError> {
    let state = hypervisor_state();
    let id = state.next_vm_id.fetch_add(1, Ordering::SeqCst);
    info!("creating VM {id} for entry point {entry_point_name:?}");

    let mut vm = Vm::new(id);
    vm.vt.enable();
    vm.vt.prepare_host_state();

    // Execution-control resources are VM-owned frames: the I/O permission
    // map, the MSR permission map and the virtual-APIC page.
    let io_bitmap = frame::allocate_span(3).map_err(|_err| VmError::OutOfMemory)?;
    let msr_bitmap = frame::allocate_span(2).map_err(|_err| VmError::OutOfMemory)?;
    let vapic = frame::allocate_span(1).map_err(|_err| VmError::OutOfMemory)?;
    vm.owned_frames.push(io_bitmap);
    vm.owned_frames.push(msr_bitmap);
    vm.owned_frames.push(vapic);
    let resources = crate::hardware_vt::ExecutionResources {
        io_bitmap_base: io_bitmap.base,
        msr_bitmap_base: msr_bitmap.base,
        vapic_base: vapic.base,
    };
    vm.vt.prepare_execution_control(&resources);
    vm.vt.prepare_exit_and_entry_control();
    let nested_pml4_addr = vm.nested_pml4_addr() as u64;
    vm.vt.prepare_nested_paging(nested_pml4_addr);
    vm.vt.write(VmcbField::TscOffset, vm.tsc_offset);

    // Database -> linker -> image -> nested paging; a failure here aborts
    // the create with all frames released through the VM's drop.
    let layout = state
        .with_db(|db| deploy::deploy_program(&mut vm, db, entry_point_name))
        .ok_or(VmError::Unsupported)??;
    vm.vt.prepare_guest_state(&layout);

    state.vm_list.lock().push(Arc::downgrade(&vm.channels));
    vm.channels.last_tsc.store(rdtsc(), Ordering::Release);
    vm.channels
        .messages
        .post(alloc::format!("deployed {entry_point_name}").into_bytes());

    let summary = run_vm(&mut vm, state);
    if summary.clean {
        info!("VM {id} reached its terminal exit; RAX={:#x}", summary.registers.rax);
    } else {
        error!("VM {id} terminated on a fault; {:#x?}", summary.registers);
    }

    state.detach_vectors(&mut vm);
    if vm.channels.messages.len() != 0 {
        while let Some(message) = vm.channels.messages.fetch() {
            trace!("undelivered message: {:?}", core::str::from_utf8(&message));
        }
    }
    drop(vm); // releases owned frames in reverse order
    Ok(summary)
}

/// The result of handling one VM exit.
enum VmExitResult {
    /// Re-enter the guest.
    Resume,
    /// The VM ended cleanly (exit hypercall) or on a guest fault.
    Terminal { clean: bool },
    /// Host-side processing failed; the VM cannot continue.
    Fatal(u64),
}

/// Supervises the guest from first entry to its terminal exit.
fn run_vm(vm: &mut Vm, state: &HypervisorState) -> ExitSummary {
    loop {
        // Inject-interrupt state: one vector per open window, strictly in
        // enqueue order. A closed window turns into a window-exit request.
        if !vm.channels.interrupts.is_empty() {
            if vm.vt.interrupt_window_open() {
                if let Some(vector) = vm.channels.interrupts.pop() {
                    trace!("injecting vector {vector:#x}");
                    vm.vt.inject_interrupt(vector);
                }
                vm.vt
                    .request_interrupt_window_exit(!vm.channels.interrupts.is_empty());
            } else {
                vm.vt.request_interrupt_window_exit(true);
            }
        }

        let reason = vm.vt.run();

        // Every exit advances the virtual timers; the time-slice exits
        // bound how stale they can get.
        state.notify_timers();

        let result = match reason {
            VmExitReason::Cpuid => handle_cpuid(vm),
            VmExitReason::Rdmsr => handle_rdmsr(vm),
            VmExitReason::Wrmsr => handle_wrmsr(vm),
            VmExitReason::Rdtsc => handle_rdtsc(vm),
            VmExitReason::Io(qualification) => handle_io(vm, &qualification),
            VmExitReason::CrAccess(qualification) => handle_cr_access(vm, &qualification),
            VmExitReason::Hypercall => handle_hypercall(vm, state),
            VmExitReason::NestedPageFault(qualification) => {
                handle_nested_page_fault(vm, state, &qualification)
            }
            VmExitReason::Hlt => {
                // Nothing to run until an interrupt or timer arrives; the
                // next pass injects whatever became pending.
                vm.vt.advance_rip();
                VmExitResult::Resume
            }
            VmExitReason::Invlpg => {
                vm.vt.advance_rip();
                vm.vt.invalidate_caches();
                VmExitResult::Resume
            }
            VmExitReason::ExternalInterrupt => {
                // With acknowledge-on-exit the vector of the host interrupt
                // is recorded; fan it out to every VM routed for it.
                let info = vm.vt.read(VmcbField::ExitInterruptionInfo);
                if info & (1 << 31) != 0 {
                    state.route_external_interrupt(info as u8);
                }
                VmExitResult::Resume
            }
            VmExitReason::InterruptWindow => {
                vm.vt.request_interrupt_window_exit(false);
                VmExitResult::Resume
            }
            VmExitReason::TimerExpiration => VmExitResult::Resume,
            VmExitReason::Shutdown(code) => {
                warn!("VM {} shut down (triple fault), code {code:#x}", vm.id);
                VmExitResult::Terminal { clean: false }
            }
            VmExitReason::Unexpected(code) => {
                error!("unhandled VM exit {code:#x}");
                VmExitResult::Fatal(code)
            }
        };

        match result {
            VmExitResult::Resume => {}
            VmExitResult::Terminal { clean } => {
                if !clean {
                    log_guest_state(vm);
                }
                return ExitSummary {
                    clean,
                    registers: vm.vt.registers().clone(),
                };
            }
            VmExitResult::Fatal(code) => {
                error!("{:#x?}", vm.vt);
                log_guest_state(vm);
                error!("non-continuable VM exit {code:#x}");
                return ExitSummary {
                    clean: false,
                    registers: vm.vt.registers().clone(),
                };
            }
        }
    }
}

/// Logs the architectural state a misbehaving guest left behind, through
/// the logical field interface so both vendors render the same lines.
fn log_guest_state(vm: &Vm) {
    error!(
        "exit {:#x} qualification {:#x} info2 {:#x}",
        vm.vt.read(VmcbField::ExitReason),
        vm.vt.read(VmcbField::ExitQualification),
        vm.vt.read(VmcbField::ExitInfo2),
    );
    error!(
        "rip {:#x} rsp {:#x} rflags {:#x}",
        vm.vt.read(VmcbField::GuestRip),
        vm.vt.read(VmcbField::GuestRsp),
        vm.vt.read(VmcbField::GuestRflags),
    );
    error!(
        "cr0 {:#x} cr3 {:#x} cr4 {:#x} efer {:#x}",
        vm.vt.read(VmcbField::GuestCr0),
        vm.vt.read(VmcbField::GuestCr3),
        vm.vt.read(VmcbField::GuestCr4),
        vm.vt.read(VmcbField::GuestEfer),
    );
    error!(
        "gdtr {:#x} idtr {:#x} tsc offset {:#x}",
        vm.vt.read(VmcbField::GuestGdtrBase),
        vm.vt.read(VmcbField::GuestIdtrBase),
        vm.vt.read(VmcbField::TscOffset),
    );
}

/// CPUID: forward the identification and feature leaves with the
/// hypervisor-present bit forced on, zero everything else.
fn handle_cpuid(vm: &mut Vm) -> VmExitResult {
    const CPUID_HYPERVISOR_PRESENT: u32 = 1 << 31;

    let leaf = vm.vt.registers().rax as u32;
    let subleaf = vm.vt.registers().rcx as u32;
    let result = match leaf {
        0x0 | 0x7 | 0x8000_0000..=0x8000_0008 => cpuid(leaf, subleaf),
        0x1 => {
            let mut result = cpuid(leaf, subleaf);
            result.ecx |= CPUID_HYPERVISOR_PRESENT;
            result
        }
        _ => x86::cpuid::CpuIdResult {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
        },
    };
    let registers = vm.vt.registers_mut();
    registers.rax = u64::from(result.eax);
    registers.rbx = u64::from(result.ebx);
    registers.rcx = u64::from(result.ecx);
    registers.rdx = u64::from(result.edx);
    vm.vt.advance_rip();
    VmExitResult::Resume
}

/// RDMSR: the local-APIC timer registers come from the lapic shadow;
/// benign MSRs forward from hardware; everything else faults the guest.
fn handle_rdmsr(vm: &mut Vm) -> VmExitResult {
    const IA32_TSC: u32 = 0x10;
    const IA32_MISC_ENABLE: u32 = 0x1a0;

    let msr = vm.vt.registers().rcx as u32;
    let value = match msr {
        X2APIC_MSR_LVT_TIMER => vm.channels.lapic.lock().read_lvt(),
        X2APIC_MSR_TIMER_DIVIDER => vm.channels.lapic.lock().read_divider(),
        X2APIC_MSR_TIMER_INITIAL_COUNT => vm.channels.lapic.lock().timer_initial,
        X2APIC_MSR_CURRENT_COUNT => vm.channels.lapic.lock().timer_current,
        X2APIC_MSR_TPR => vm.channels.lapic.lock().tpr,
        IA32_TSC => rdtsc().wrapping_add(vm.tsc_offset),
        IA32_MISC_ENABLE => rdmsr(msr),
        _ => {
            warn!("guest read of unhandled MSR {msr:#x}");
            return VmExitResult::Terminal { clean: false };
        }
    };
    let registers = vm.vt.registers_mut();
    registers.rax = value & 0xffff_ffff;
    registers.rdx = value >> 32;
    vm.vt.advance_rip();
    VmExitResult::Resume
}

/// WRMSR: timer programming lands in the lapic shadow; EOI and TPR update
/// it too; everything else faults the guest.
fn handle_wrmsr(vm: &mut Vm) -> VmExitResult {
    let registers = vm.vt.registers();
    let msr = registers.rcx as u32;
    let value = (registers.rdx << 32) | (registers.rax & 0xffff_ffff);
    match msr {
        X2APIC_MSR_LVT_TIMER => {
            vm.channels.lapic.lock().write_lvt(value);
            // The programmed vector doubles as this VM's routed vector.
            let vector = value as u8;
            if !vm.mapped_vectors.contains(&vector) {
                hypervisor_state().attach_vector(vm, vector);
            }
        }
        X2APIC_MSR_TIMER_DIVIDER => vm.channels.lapic.lock().write_divider(value),
        X2APIC_MSR_TIMER_INITIAL_COUNT => {
            vm.channels.lapic.lock().write_initial_count(value);
            vm.channels
                .last_tsc
                .store(rdtsc(), core::sync::atomic::Ordering::Release);
        }
        X2APIC_MSR_EOI => {
            trace!("guest EOI");
        }
        X2APIC_MSR_TPR => vm.channels.lapic.lock().tpr = value,
        _ => {
            warn!("guest write of unhandled MSR {msr:#x} = {value:#x}");
            return VmExitResult::Terminal { clean: false };
        }
    }
    vm.vt.advance_rip();
    VmExitResult::Resume
}

/// RDTSC: the host counter plus the VM's offset.
fn handle_rdtsc(vm: &mut Vm) -> VmExitResult {
    let value = rdtsc().wrapping_add(vm.tsc_offset);
    let registers = vm.vt.registers_mut();
    registers.rax = value & 0xffff_ffff;
    registers.rdx = value >> 32;
    vm.vt.advance_rip();
    VmExitResult::Resume
}

/// IN/OUT: the open serial and PS/2 ports forward to hardware; any other
/// port faults the guest.
fn handle_io(vm: &mut Vm, qualification: &IoQualification) -> VmExitResult {
    let open = crate::hardware_vt::GUEST_OPEN_PORTS.contains(&qualification.port);
    if !open {
        warn!(
            "guest access to closed port {:#x} ({})",
            qualification.port,
            if qualification.write { "out" } else { "in" }
        );
        return VmExitResult::Terminal { clean: false };
    }
    let port = qualification.port;
    let registers = vm.vt.registers_mut();
    if qualification.write {
        match qualification.size {
            1 => outb(port, registers.rax as u8),
            2 => outw(port, registers.rax as u16),
            _ => outl(port, registers.rax as u32),
        }
    } else {
        let value = match qualification.size {
            1 => u64::from(inb(port)),
            2 => u64::from(inw(port)),
            _ => u64::from(inl(port)),
        };
        let keep = match qualification.size {
            1 => registers.rax & !0xff,
            2 => registers.rax & !0xffff,
            _ => 0,
        };
        registers.rax = keep | value;
    }
    vm.vt.advance_rip();
    VmExitResult::Resume
}

/// CR3/CR8 accesses update the guest's shadow state and reenter.
fn handle_cr_access(vm: &mut Vm, qualification: &CrAccessQualification) -> VmExitResult {
    let field = match qualification.register {
        3 => VmcbField::GuestCr3,
        8 => VmcbField::GuestCr8,
        other => {
            error!("unexpected CR{other} access");
            return VmExitResult::Fatal(u64::from(other));
        }
    };
    if qualification.write {
        let value = gpr_read(vm.vt.registers(), qualification.gpr);
        vm.vt.write(field, value);
        if qualification.register == 3 {
            vm.vt.invalidate_caches();
        }
    } else {
        let value = vm.vt.read(field);
        gpr_write(vm.vt.registers_mut(), qualification.gpr, value);
    }
    vm.vt.advance_rip();
    VmExitResult::Resume
}

/// The cooperative exit: decode RAX and serve the request. Unknown codes
/// fault the guest.
fn handle_hypercall(vm: &mut Vm, state: &HypervisorState) -> VmExitResult {
    let registers = vm.vt.registers();
    let Some(call) = Hypercall::decode(registers.rax, registers.rdi) else {
        warn!("unknown hypercall {:#x}", registers.rax);
        return VmExitResult::Terminal { clean: false };
    };
    trace!("hypercall {call:x?}");

    match call {
        Hypercall::DynamicLoad { got_entry_offset } => {
            let outcome = state
                .with_db(|db| deploy::load_module(vm, db, got_entry_offset))
                .unwrap_or(Err(VmError::Unsupported));
            let result = match outcome {
                Ok(()) => 0,
                Err(err) => {
                    error!("dynamic load failed: {err:?}");
                    1
                }
            };
            vm.vt.registers_mut().rax = result;
        }
        Hypercall::Print { string_gva } => {
            const PRINT_LIMIT: usize = 0x1000;
            match vm.copy_string_from_guest(string_gva, PRINT_LIMIT) {
                Some(bytes) => {
                    vm.channels.output.lock().extend_from_slice(&bytes);
                    #[cfg(feature = "serial_guest_output")]
                    crate::logger::write_guest_bytes(&bytes);
                    vm.vt.registers_mut().rax = 0;
                }
                None => {
                    warn!("print hypercall with unmapped string at {string_gva:#x}");
                    vm.vt.registers_mut().rax = 1;
                }
            }
        }
        Hypercall::Exit => {
            vm.vt.advance_rip();
            return VmExitResult::Terminal { clean: true };
        }
        Hypercall::GetHpa { gva } => {
            let guest_cr3 = vm.vt.read(VmcbField::GuestCr3);
            let hpa = vm
                .translate_guest_virtual(guest_cr3, gva)
                .unwrap_or(u64::MAX);
            vm.vt.registers_mut().rax = hpa;
        }
    }
    vm.vt.advance_rip();
    VmExitResult::Resume
}

/// Nested page faults: released regions are the guest's own fault; a
/// translation raced in by another processor resolves idempotently; a
/// fault inside the span of a module the GOT flags as pending merges that
/// module into the guest; any other address is fatal to the guest.
fn handle_nested_page_fault(
    vm: &mut Vm,
    state: &HypervisorState,
    qualification: &NestedPageFaultQualification,
) -> VmExitResult {
    let gpa = qualification.gpa;
    if vm
        .released_pages
        .iter()
        .any(|&(base, size)| gpa >= base && gpa < base + size)
    {
        warn!(
            "guest touched released region at {gpa:#x} (rip {:#x})",
            qualification.rip
        );
        return VmExitResult::Terminal { clean: false };
    }

    if !qualification.missing_translation {
        // A permission violation on mapped memory; nothing to grow.
        error!(
            "nested paging violation at {gpa:#x} (write: {})",
            qualification.write_access
        );
        return VmExitResult::Terminal { clean: false };
    }

    if vm.translate_gpa(gpa).is_some() {
        // Another processor mapped it between the fault and now; no
        // additional frames are consumed.
        vm.vt.invalidate_caches();
        return VmExitResult::Resume;
    }

    // The address belongs to a module the GOT flags as pending: built and
    // placed, not yet merged. Fault it in and retry the access.
    if let Some(got_offset) = vm.pending_module_got_offset(gpa) {
        debug!("fault at {gpa:#x} resolves through the pending module at GOT offset {got_offset:#x}");
        return match state.with_db(|db| deploy::load_module(vm, db, got_offset)) {
            Some(Ok(())) => VmExitResult::Resume,
            outcome => {
                error!("pending-module merge at {gpa:#x} failed: {outcome:?}");
                VmExitResult::Terminal { clean: false }
            }
        };
    }

    warn!(
        "guest access outside its physical space: {gpa:#x} at rip {:#x}",
        qualification.rip
    );
    VmExitResult::Terminal { clean: false }
}
