//! A four-level x86-64 page-table builder over caller-provided frames.
//!
//! The linker uses this to synthesize the page table a guest boots with;
//! the kernel feeds it frames owned by the VM, tests feed it plain heap
//! pages. Entries use the standard long-mode layout, so the resulting root
//! can be loaded into guest CR3 unchanged.

use alloc::vec::Vec;
use bitfield::bitfield;
use bitflags::bitflags;

/// Supplies zeroed, page-aligned physical frames for table pages and
/// reports the address the running code can write them through.
pub trait FrameSource {
    /// Returns (physical address, writable pointer) of one zeroed 4 KiB
    /// frame, or `None` when exhausted.
    fn allocate_table_page(&mut self) -> Option<(u64, *mut u8)>;

    /// Translates a physical frame address previously returned by
    /// [`FrameSource::allocate_table_page`] back to a writable pointer.
    fn table_page_at(&mut self, physical: u64) -> Option<*mut u8>;
}

impl<T: FrameSource + ?Sized> FrameSource for &mut T {
    fn allocate_table_page(&mut self) -> Option<(u64, *mut u8)> {
        (**self).allocate_table_page()
    }

    fn table_page_at(&mut self, physical: u64) -> Option<*mut u8> {
        (**self).table_page_at(physical)
    }
}

bitflags! {
    /// Mapping attributes. Absence of WRITABLE makes a page read-only;
    /// NO_EXECUTE sets the XD bit; GLOBAL survives CR3 reloads.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageAttributes: u8 {
        /// The page accepts stores.
        const WRITABLE = 1 << 0;
        /// The page never executes (sets the XD bit).
        const NO_EXECUTE = 1 << 1;
        /// The translation survives CR3 reloads.
        const GLOBAL = 1 << 2;
    }
}

bitfield! {
    /// One long-mode page-table entry.
    #[derive(Clone, Copy)]
    pub struct PageTableEntry(u64);
    impl Debug;
    pub present, set_present: 0;
    pub writable, set_writable: 1;
    pub user, set_user: 2;
    accessed, _: 5;
    dirty, _: 6;
    pub global, set_global: 8;
    pub pfn, set_pfn: 51, 12;
    pub no_execute, set_no_execute: 63;
}

const ENTRIES_PER_TABLE: u64 = 512;

/// Failures of table construction and translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PagingError {
    /// The [`FrameSource`] ran out of table pages.
    OutOfFrames,
    /// The virtual address already holds a translation.
    AlreadyMapped(u64),
    /// No translation exists for the address.
    Unmapped(u64),
}

/// A page table under construction. Holds only physical addresses; every
/// access goes back through the [`FrameSource`].
#[derive(Clone, Copy, Debug)]
pub struct PageTableBuilder {
    root_physical: u64,
}

impl PageTableBuilder {
    /// Allocates the root (PML4) page.
    pub fn new(frames: &mut impl FrameSource) -> Result<Self, PagingError> {
        let (root_physical, _) = frames.allocate_table_page().ok_or(PagingError::OutOfFrames)?;
        Ok(Self { root_physical })
    }

    /// Physical address to load into CR3.
    #[must_use]
    pub fn root_physical(&self) -> u64 {
        self.root_physical
    }

    fn entry_at(
        frames: &mut impl FrameSource,
        table_physical: u64,
        index: u64,
    ) -> Result<*mut u64, PagingError> {
        let page = frames
            .table_page_at(table_physical)
            .ok_or(PagingError::Unmapped(table_physical))?;
        // Entries are naturally aligned u64 slots within the table page.
        Ok(unsafe { page.cast::<u64>().add(index as usize) })
    }

    fn walk_or_create(
        &mut self,
        frames: &mut impl FrameSource,
        table_physical: u64,
        index: u64,
    ) -> Result<u64, PagingError> {
        let slot = Self::entry_at(frames, table_physical, index)?;
        let mut entry = PageTableEntry(unsafe { slot.read() });
        if !entry.present() {
            let (next_physical, _) = frames.allocate_table_page().ok_or(PagingError::OutOfFrames)?;
            entry = PageTableEntry(0);
            entry.set_present(true);
            entry.set_writable(true);
            entry.set_pfn(next_physical >> 12);
            unsafe { slot.write(entry.0) };
        }
        Ok(entry.pfn() << 12)
    }

    /// Maps one 4 KiB page. Mapping an address that is already mapped
    /// reports [`PagingError::AlreadyMapped`] and consumes no frames.
    pub fn map_page(
        &mut self,
        frames: &mut impl FrameSource,
        virtual_address: u64,
        physical_address: u64,
        attributes: PageAttributes,
    ) -> Result<(), PagingError> {
        let pml4_index = (virtual_address >> 39) & (ENTRIES_PER_TABLE - 1);
        let pdpt_index = (virtual_address >> 30) & (ENTRIES_PER_TABLE - 1);
        let pd_index = (virtual_address >> 21) & (ENTRIES_PER_TABLE - 1);
        let pt_index = (virtual_address >> 12) & (ENTRIES_PER_TABLE - 1);

        let pdpt = self.walk_or_create(frames, self.root_physical, pml4_index)?;
        let pd = self.walk_or_create(frames, pdpt, pdpt_index)?;
        let pt = self.walk_or_create(frames, pd, pd_index)?;

        let slot = Self::entry_at(frames, pt, pt_index)?;
        let existing = PageTableEntry(unsafe { slot.read() });
        if existing.present() {
            return Err(PagingError::AlreadyMapped(virtual_address));
        }
        let mut entry = PageTableEntry(0);
        entry.set_present(true);
        entry.set_writable(attributes.contains(PageAttributes::WRITABLE));
        entry.set_global(attributes.contains(PageAttributes::GLOBAL));
        entry.set_no_execute(attributes.contains(PageAttributes::NO_EXECUTE));
        entry.set_pfn(physical_address >> 12);
        unsafe { slot.write(entry.0) };
        Ok(())
    }

    /// Repoints one mapped page at a new physical frame, keeping the
    /// intermediate tables. Used when a running image swaps a region (the
    /// global offset table after a module merge).
    pub fn remap_page(
        &mut self,
        frames: &mut impl FrameSource,
        virtual_address: u64,
        physical_address: u64,
        attributes: PageAttributes,
    ) -> Result<(), PagingError> {
        let mut table = self.root_physical;
        for shift in [39u64, 30, 21] {
            let index = (virtual_address >> shift) & (ENTRIES_PER_TABLE - 1);
            let slot = Self::entry_at(frames, table, index)?;
            let entry = PageTableEntry(unsafe { slot.read() });
            if !entry.present() {
                return Err(PagingError::Unmapped(virtual_address));
            }
            table = entry.pfn() << 12;
        }
        let index = (virtual_address >> 12) & (ENTRIES_PER_TABLE - 1);
        let slot = Self::entry_at(frames, table, index)?;
        let mut entry = PageTableEntry(0);
        entry.set_present(true);
        entry.set_writable(attributes.contains(PageAttributes::WRITABLE));
        entry.set_global(attributes.contains(PageAttributes::GLOBAL));
        entry.set_no_execute(attributes.contains(PageAttributes::NO_EXECUTE));
        entry.set_pfn(physical_address >> 12);
        unsafe { slot.write(entry.0) };
        Ok(())
    }

    /// Rebuilds a page table root from an existing root address (used to
    /// continue mapping into a table built earlier).
    #[must_use]
    pub fn from_root(root_physical: u64) -> Self {
        Self { root_physical }
    }

    /// Maps `page_count` consecutive pages starting at the given addresses.
    pub fn map_span(
        &mut self,
        frames: &mut impl FrameSource,
        virtual_address: u64,
        physical_address: u64,
        page_count: u64,
        attributes: PageAttributes,
    ) -> Result<(), PagingError> {
        for page in 0..page_count {
            self.map_page(
                frames,
                virtual_address + page * crate::PAGE_SIZE,
                physical_address + page * crate::PAGE_SIZE,
                attributes,
            )?;
        }
        Ok(())
    }

    /// Resolves a virtual address to its mapped physical address.
    pub fn translate(
        &self,
        frames: &mut impl FrameSource,
        virtual_address: u64,
    ) -> Result<u64, PagingError> {
        let mut table = self.root_physical;
        for shift in [39u64, 30, 21] {
            let index = (virtual_address >> shift) & (ENTRIES_PER_TABLE - 1);
            let slot = Self::entry_at(frames, table, index)?;
            let entry = PageTableEntry(unsafe { slot.read() });
            if !entry.present() {
                return Err(PagingError::Unmapped(virtual_address));
            }
            table = entry.pfn() << 12;
        }
        let index = (virtual_address >> 12) & (ENTRIES_PER_TABLE - 1);
        let slot = Self::entry_at(frames, table, index)?;
        let entry = PageTableEntry(unsafe { slot.read() });
        if !entry.present() {
            return Err(PagingError::Unmapped(virtual_address));
        }
        Ok((entry.pfn() << 12) | (virtual_address & 0xfff))
    }
}

/// A page-aligned table page for [`HeapFrameSource`].
#[derive(Debug)]
#[repr(C, align(4096))]
struct TablePage([u8; crate::PAGE_SIZE as usize]);

/// A heap-backed frame source for tests and for staged image builds: frames
/// are boxed pages whose "physical" address is their host address.
#[derive(Debug, Default)]
pub struct HeapFrameSource {
    pages: Vec<alloc::boxed::Box<TablePage>>,
}

impl HeapFrameSource {
    /// Creates an empty source; pages are boxed on demand.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How many table pages have been handed out so far.
    #[must_use]
    pub fn allocated_pages(&self) -> usize {
        self.pages.len()
    }
}

impl FrameSource for HeapFrameSource {
    fn allocate_table_page(&mut self) -> Option<(u64, *mut u8)> {
        let mut page = alloc::boxed::Box::new(TablePage([0u8; crate::PAGE_SIZE as usize]));
        let pointer: *mut u8 = page.0.as_mut_ptr();
        self.pages.push(page);
        Some((pointer as u64, pointer))
    }

    fn table_page_at(&mut self, physical: u64) -> Option<*mut u8> {
        self.pages
            .iter_mut()
            .find(|page| core::ptr::from_ref::<TablePage>(&***page) as u64 == physical)
            .map(|page| page.0.as_mut_ptr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_translate() {
        let mut frames = HeapFrameSource::new();
        let mut builder = PageTableBuilder::new(&mut frames).unwrap();
        builder
            .map_page(&mut frames, 0x40_0000, 0x1234_5000, PageAttributes::WRITABLE)
            .unwrap();
        assert_eq!(
            builder.translate(&mut frames, 0x40_0abc).unwrap(),
            0x1234_5abc
        );
    }

    #[test]
    fn double_map_consumes_no_frames() {
        let mut frames = HeapFrameSource::new();
        let mut builder = PageTableBuilder::new(&mut frames).unwrap();
        builder
            .map_page(&mut frames, 0x40_0000, 0x1000, PageAttributes::empty())
            .unwrap();
        let used = frames.allocated_pages();
        assert_eq!(
            builder.map_page(&mut frames, 0x40_0000, 0x1000, PageAttributes::empty()),
            Err(PagingError::AlreadyMapped(0x40_0000))
        );
        assert_eq!(frames.allocated_pages(), used);
    }

    #[test]
    fn unmapped_translation_fails() {
        let mut frames = HeapFrameSource::new();
        let builder = PageTableBuilder::new(&mut frames).unwrap();
        assert_eq!(
            builder.translate(&mut frames, 0xdead_b000),
            Err(PagingError::Unmapped(0xdead_b000))
        );
    }
}
