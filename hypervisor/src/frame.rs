//! Owner-tagged physical frame spans over the UEFI page allocator.
//!
//! Every span a VM consumes is recorded in its owned-frame list; teardown
//! walks that list strictly in reverse allocation order. UEFI runs with
//! identity-mapped memory, so a frame's physical address doubles as its
//! accessible pointer.

use crate::system_table::system_table;
use alloc::vec::Vec;
use log::{error, trace};
use stonelink::paging::FrameSource;
use uefi::table::boot::{AllocateType, MemoryType};

/// A contiguous, page-aligned physical allocation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameSpan {
    pub(crate) base: u64,
    pub(crate) pages: usize,
}

impl FrameSpan {
    pub(crate) fn size(&self) -> u64 {
        self.pages as u64 * 0x1000
    }

    /// The span's contents as a host-accessible slice.
    pub(crate) fn as_slice_mut(&self) -> &'static mut [u8] {
        // Identity mapping holds for boot-services memory.
        unsafe { core::slice::from_raw_parts_mut(self.base as *mut u8, self.size() as usize) }
    }
}

/// Allocates a zeroed span of `pages` frames.
pub(crate) fn allocate_span(pages: usize) -> Result<FrameSpan, uefi::Error> {
    let base = system_table().boot_services().allocate_pages(
        AllocateType::AnyPages,
        MemoryType::BOOT_SERVICES_DATA,
        pages,
    )?;
    let span = FrameSpan { base, pages };
    span.as_slice_mut().fill(0);
    trace!("allocated {pages} frames at {base:#x}");
    Ok(span)
}

/// Scrubs and releases one span.
pub(crate) fn release_span(span: FrameSpan) {
    span.as_slice_mut().fill(0);
    if let Err(err) = system_table()
        .boot_services()
        .free_pages(span.base, span.pages)
    {
        error!("cannot release {} frames at {:#x}: {err:?}", span.pages, span.base);
    }
    trace!("released {} frames at {:#x}", span.pages, span.base);
}

/// Releases every span in reverse allocation order.
pub(crate) fn release_all(spans: &mut Vec<FrameSpan>) {
    while let Some(span) = spans.pop() {
        release_span(span);
    }
}

/// A [`FrameSource`] that allocates page-table frames one at a time and
/// records each in the owned-frame list it borrows.
pub(crate) struct OwnedFrameSource<'a> {
    owned: &'a mut Vec<FrameSpan>,
}

impl<'a> OwnedFrameSource<'a> {
    pub(crate) fn new(owned: &'a mut Vec<FrameSpan>) -> Self {
        Self { owned }
    }
}

impl FrameSource for OwnedFrameSource<'_> {
    fn allocate_table_page(&mut self) -> Option<(u64, *mut u8)> {
        let span = allocate_span(1).ok()?;
        self.owned.push(span);
        Some((span.base, span.base as *mut u8))
    }

    fn table_page_at(&mut self, physical: u64) -> Option<*mut u8> {
        Some(physical as *mut u8)
    }
}
