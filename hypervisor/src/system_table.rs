//! Global access to the UEFI system table.
//!
//! The table is stored once at boot and handed out behind a spin lock so
//! that the allocator and the disk layer serialize their boot-services
//! calls.

use core::ops::Deref;
use spin::{Mutex, MutexGuard};
use uefi::{
    prelude::{Boot, SystemTable},
    Handle,
};

static SYSTEM_TABLE: Mutex<Option<SystemTable<Boot>>> = Mutex::new(None);
static IMAGE_HANDLE: Mutex<Option<Handle>> = Mutex::new(None);

/// A locked handle to the system table; boot-services calls made through it
/// are serialized against other holders.
pub(crate) struct SystemTableGuard(MutexGuard<'static, Option<SystemTable<Boot>>>);

impl Deref for SystemTableGuard {
    type Target = SystemTable<Boot>;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref().unwrap()
    }
}

/// Stores the system table and the image handle. Must be called exactly
/// once, before any allocation.
pub(crate) fn init_system_table(system_table: SystemTable<Boot>, image: Handle) {
    let mut table = SYSTEM_TABLE.lock();
    assert!(table.is_none());
    *table = Some(system_table);
    *IMAGE_HANDLE.lock() = Some(image);
}

/// Returns the locked system table.
///
/// # Panics
///
/// Panics when called before [`init_system_table`].
pub(crate) fn system_table() -> SystemTableGuard {
    let guard = SYSTEM_TABLE.lock();
    assert!(guard.is_some());
    SystemTableGuard(guard)
}

/// Returns a clone of the system table without holding the lock.
///
/// # Safety
///
/// The caller must ensure no other processor uses boot services
/// concurrently; intended for the single-threaded boot phase.
pub(crate) unsafe fn system_table_unsafe() -> SystemTable<Boot> {
    unsafe { SYSTEM_TABLE.lock().as_ref().unwrap().unsafe_clone() }
}

/// Returns the image handle of this kernel.
pub(crate) fn image_handle() -> Handle {
    IMAGE_HANDLE.lock().unwrap()
}
