//! The module containing various constants that may be modified by developers.

/// The logging level.
pub(crate) const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Debug;

/// The entry-point symbol the boot path builds and runs as the
/// demonstration guest.
pub(crate) const DEMO_ENTRY_POINT: &str = "vm_demo";

/// The on-disk module database file, looked up on the boot volume. When the
/// file does not exist, a memory-backed store seeded with the demonstration
/// modules is used instead.
pub(crate) const MODULE_DB_PATH: &str = "modules.db";

/// Guest-virtual base the program is linked at; the header page sits one
/// page below the program itself.
pub(crate) const GUEST_PROGRAM_VIRTUAL_BASE: u64 = 0x2_0000_0000;

/// Guest-virtual stack span.
pub(crate) const GUEST_STACK_VIRTUAL_BASE: u64 = 1 << 40;
pub(crate) const GUEST_STACK_SIZE: u64 = 0x1_0000;

/// Guest-virtual heap span.
pub(crate) const GUEST_HEAP_VIRTUAL_BASE: u64 = 4 << 40;
pub(crate) const GUEST_HEAP_SIZE: u64 = 0x10_0000;

/// Fixed guest-virtual addresses of the descriptor tables. The backing
/// frames are owned by the VM and identity mapped in the guest page table.
pub(crate) const GUEST_IDTR_BASE: u64 = 0x1000;
pub(crate) const GUEST_GDTR_BASE: u64 = 0x2000;
pub(crate) const GUEST_TR_BASE: u64 = 0x3000;
pub(crate) const GUEST_IDTR_LIMIT: u64 = 0xfff;
pub(crate) const GUEST_GDTR_LIMIT: u64 = 0x2f;
pub(crate) const GUEST_TR_LIMIT: u64 = 0x67;

/// TSC ticks per virtual-timer tick when calibration against the platform
/// timer is unavailable.
pub(crate) const DEFAULT_RDTSC_PER_TIMER_TICK: u64 = 1_000_000;

/// How long the guest may run between forced exits, in TSC. Bounds the
/// latency of virtual-timer delivery and interrupt injection while the
/// guest does not exit on its own.
pub(crate) const GUEST_TIME_SLICE_IN_TSC: u64 = 10_000_000;
