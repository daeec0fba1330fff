//! The module containing the boot-services-backed global allocator.
//!
//! Memory handed out here lives until `ExitBootServices`, which this kernel
//! never calls. Page-aligned requests go through `allocate_pages` so that
//! structures like VMCS regions and bitmaps land on page boundaries;
//! everything else goes through the pool allocator, with manual alignment
//! when the pool's 8-byte guarantee is insufficient.

use crate::{size_to_pages, system_table::system_table};
use core::alloc::{GlobalAlloc, Layout};
use uefi::table::boot::{AllocateType, MemoryType};

struct BootServicesAllocator;

#[allow(clippy::cast_ptr_alignment)]
unsafe impl GlobalAlloc for BootServicesAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        let align = layout.align();

        if (align % 0x1000) == 0 {
            return system_table()
                .boot_services()
                .allocate_pages(
                    AllocateType::AnyPages,
                    MemoryType::BOOT_SERVICES_DATA,
                    size_to_pages(size),
                )
                .unwrap_or(0) as *mut u8;
        }

        if align <= 8 {
            return system_table()
                .boot_services()
                .allocate_pool(MemoryType::BOOT_SERVICES_DATA, size)
                .map_or(core::ptr::null_mut(), core::ptr::NonNull::as_ptr);
        }

        // Over-allocate and stash the raw pointer just below the aligned
        // block so `dealloc` can recover it.
        let Ok(raw) = system_table()
            .boot_services()
            .allocate_pool(MemoryType::BOOT_SERVICES_DATA, size + align)
        else {
            return core::ptr::null_mut();
        };
        let raw = raw.as_ptr();
        let mut offset = raw.align_offset(align);
        if offset == 0 {
            offset = align;
        }
        let aligned = unsafe { raw.add(offset) };
        unsafe { aligned.cast::<*mut u8>().sub(1).write(raw) };
        aligned
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if (layout.align() % 0x1000) == 0 {
            unsafe {
                system_table()
                    .boot_services()
                    .free_pages(ptr as u64, size_to_pages(layout.size()))
                    .unwrap();
            };
        } else if layout.align() <= 8 {
            unsafe { system_table().boot_services().free_pool(ptr).unwrap() };
        } else {
            let raw = unsafe { ptr.cast::<*mut u8>().sub(1).read() };
            unsafe { system_table().boot_services().free_pool(raw).unwrap() };
        }
    }
}

#[global_allocator]
static ALLOCATOR: BootServicesAllocator = BootServicesAllocator;
