//! The module containing the [`Vm`] type: one running guest, its vendor
//! control block, its nested paging structures, the frames it owns, and
//! the channels the rest of the host reaches it through.

use crate::{
    frame::{self, FrameSpan},
    hardware_vt::{
        svm::Svm, vmx::Vmx, HardwareVt, NestedPagingStructure, NestedPagingStructureEntry,
        NestedPagingStructureEntryType,
    },
    ipc::VmChannels,
    x86_instructions::cpu_vendor,
};
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use core::ptr::addr_of;
use log::{debug, error, trace};
use stonelink::{
    image::ProgramHeader,
    paging::{PageTableBuilder, PagingError},
    PAGE_SIZE,
};

/// A module freshly linked into a running guest, to be spliced into its
/// address space by [`Vm::merge_module`].
#[derive(Clone, Debug, Default)]
pub(crate) struct ModuleLoad {
    /// Physical spans of the new module's sections (guest-physical equals
    /// host-physical for VM-owned frames).
    pub(crate) module_spans: Vec<FrameSpan>,
    pub(crate) old_got_physical: u64,
    pub(crate) old_got_size: u64,
    pub(crate) new_got_physical: u64,
    pub(crate) new_got_size: u64,
}

/// The representation of a virtual machine: registers and memory managed
/// through [`HardwareVt`], preallocated [`NestedPagingStructure`]s to
/// build GPA -> PA translations, the owned physical frames, and the loaded
/// program's layout.
pub(crate) struct Vm {
    /// Encapsulates implementation of hardware assisted virtualization
    /// technology, which is capable of managing VM's registers and memory.
    pub(crate) vt: Box<dyn HardwareVt>,

    pub(crate) id: u64,

    /// The nested PML4. All other nested paging structures are built on
    /// the fly by consuming [`Vm::nested_paging_structures`].
    nested_pml4: Box<NestedPagingStructure>,

    /// Preallocated nested paging structures for dynamically building
    /// GPA -> PA translation.
    nested_paging_structures: Box<[NestedPagingStructure]>,

    /// How many [`Vm::nested_paging_structures`] have been consumed.
    used_nps_count: usize,

    /// Queues, lapic shadow and output shared with the routing table.
    pub(crate) channels: Arc<VmChannels>,

    /// Every physical span this VM owns, in allocation order. Teardown
    /// releases them in exact reverse.
    pub(crate) owned_frames: Vec<FrameSpan>,

    /// Modules the running image loads, by module id.
    pub(crate) loaded_modules: BTreeMap<u64, bool>,

    /// Vectors this VM is registered for in the routing table.
    pub(crate) mapped_vectors: Vec<u8>,

    /// Guest-physical page ranges the image declared released; faults in
    /// them are the guest's own problem.
    pub(crate) released_pages: Vec<(u64, u64)>,

    /// The program header of the deployed image.
    pub(crate) program: ProgramHeader,

    /// The link context of the deployed program, kept alive for dynamic
    /// loads so GOT indexes and placed addresses stay stable.
    pub(crate) linker: Option<stonelink::linker::LinkerContext>,

    /// Additive TSC skew the RDTSC emulation applies.
    pub(crate) tsc_offset: u64,
}

impl Vm {
    pub(crate) fn new(id: u64) -> Self {
        // The number of preallocated nested paging structures. The more
        // memory the VM maps, the more tables are consumed; the pool is
        // sized for the image, GOT, stack, heap and descriptor frames of a
        // typical program plus dynamically loaded modules.
        const NPS_COUNT: usize = 1024;

        // Use VMX on Intel and SVM on AMD.
        let vt: Box<dyn HardwareVt> = if is_intel() {
            trace!("processor is Intel");
            Box::new(Vmx::new())
        } else {
            trace!("processor is AMD");
            Box::new(Svm::new())
        };

        let nested_pml4 = unsafe { Box::<NestedPagingStructure>::new_zeroed().assume_init() };
        let nested_paging_structures =
            unsafe { Box::<[NestedPagingStructure]>::new_zeroed_slice(NPS_COUNT).assume_init() };

        Self {
            vt,
            id,
            nested_pml4,
            nested_paging_structures,
            used_nps_count: 0,
            channels: Arc::new(VmChannels::default()),
            owned_frames: Vec::new(),
            loaded_modules: BTreeMap::new(),
            mapped_vectors: Vec::new(),
            released_pages: Vec::new(),
            program: ProgramHeader::default(),
            linker: None,
            tsc_offset: 0,
        }
    }

    pub(crate) fn nested_pml4_addr(&mut self) -> *mut NestedPagingStructure {
        self.nested_pml4.as_mut() as *mut _
    }

    /// Builds the GPA -> PA translation for one page. Returns whether a new
    /// translation was added; mapping an already-mapped page consumes no
    /// structures and changes nothing, so racing mappings are idempotent.
    #[allow(clippy::similar_names)]
    pub(crate) fn map_page(&mut self, gpa: u64, pa: u64) -> bool {
        let pml4i = (gpa >> 39) & 0b1_1111_1111;
        let pdpti = (gpa >> 30) & 0b1_1111_1111;
        let pdi = (gpa >> 21) & 0b1_1111_1111;
        let pti = (gpa >> 12) & 0b1_1111_1111;

        // Walk PML4 -> PDPT -> PD as a processor does, allocating tables
        // from the preallocated pool as needed.
        let pml4 = unsafe { self.nested_pml4_addr().as_mut() }.unwrap();
        let pml4e = self.walk_table(pml4, pml4i as usize);
        let pdpt = pml4e.next_table_mut();
        let pdpte = self.walk_table(pdpt, pdpti as usize);
        let pd = pdpte.next_table_mut();
        let pde = self.walk_table(pd, pdi as usize);
        let pt = pde.next_table_mut();
        let pte = &mut pt.entries[pti as usize];
        if pte.0 != 0 {
            return false;
        }

        let flags = self
            .vt
            .nps_entry_flags(NestedPagingStructureEntryType::RwxWriteBack);
        pte.set_translation(pa, flags);
        true
    }

    /// Maps a span of pages GPA == PA; VM-owned frames are identity placed
    /// in the guest-physical space.
    pub(crate) fn map_span(&mut self, span: FrameSpan) {
        for page in 0..span.pages as u64 {
            let _ = self.map_page(span.base + page * PAGE_SIZE, span.base + page * PAGE_SIZE);
        }
    }

    /// Resolves a guest-physical address through the nested tables.
    pub(crate) fn translate_gpa(&mut self, gpa: u64) -> Option<u64> {
        let indexes = [
            (gpa >> 39) & 0b1_1111_1111,
            (gpa >> 30) & 0b1_1111_1111,
            (gpa >> 21) & 0b1_1111_1111,
        ];
        let mut table = unsafe { self.nested_pml4_addr().as_mut() }.unwrap();
        for index in indexes {
            let entry = &mut table.entries[index as usize];
            if entry.0 == 0 {
                return None;
            }
            table = entry.next_table_mut();
        }
        let entry = &table.entries[((gpa >> 12) & 0b1_1111_1111) as usize];
        if entry.0 == 0 {
            None
        } else {
            Some((entry.pfn() << 12) | (gpa & 0xfff))
        }
    }

    /// Walks the guest's own page table (rooted at its CR3) on top of the
    /// nested translation, resolving a guest-virtual address to host
    /// physical. Used by the print and get-hpa hypercalls.
    pub(crate) fn translate_guest_virtual(&mut self, guest_cr3: u64, gva: u64) -> Option<u64> {
        let mut table_gpa = guest_cr3 & !0xfff;
        for shift in [39u64, 30, 21] {
            let table_pa = self.translate_gpa(table_gpa)?;
            let index = (gva >> shift) & 0x1ff;
            let entry = unsafe { *((table_pa as *const u64).add(index as usize)) };
            if entry & 1 == 0 {
                return None;
            }
            table_gpa = entry & 0x000f_ffff_ffff_f000;
        }
        let table_pa = self.translate_gpa(table_gpa)?;
        let index = (gva >> 12) & 0x1ff;
        let entry = unsafe { *((table_pa as *const u64).add(index as usize)) };
        if entry & 1 == 0 {
            return None;
        }
        let page_pa = self.translate_gpa(entry & 0x000f_ffff_ffff_f000)?;
        Some(page_pa | (gva & 0xfff))
    }

    /// Copies a NUL-terminated string out of the guest, page by page.
    pub(crate) fn copy_string_from_guest(&mut self, gva: u64, max: usize) -> Option<Vec<u8>> {
        let guest_cr3 = self.vt.read(crate::hardware_vt::VmcbField::GuestCr3);
        let mut out = Vec::new();
        let mut cursor = gva;
        while out.len() < max {
            let pa = self.translate_guest_virtual(guest_cr3, cursor)?;
            let byte = unsafe { *(pa as *const u8) };
            if byte == 0 {
                return Some(out);
            }
            out.push(byte);
            cursor += 1;
        }
        Some(out)
    }

    /// Splices a newly loaded module into the running guest: its frames
    /// enter the nested translation, the relocated GOT replaces the old one
    /// under the fixed GOT address, and one cache invalidation makes it
    /// visible.
    pub(crate) fn merge_module(&mut self, load: &ModuleLoad) -> Result<(), PagingError> {
        for span in &load.module_spans {
            self.map_span(*span);
        }
        let got_pages = load.new_got_size.div_ceil(PAGE_SIZE);
        self.map_span(FrameSpan {
            base: load.new_got_physical,
            pages: got_pages as usize,
        });

        // Repoint the guest's GOT mapping at the new physical frames. The
        // guest page table lives in VM-owned frames, reachable directly.
        let mut table = PageTableBuilder::from_root(self.program.page_table_physical);
        let mut frames = frame::OwnedFrameSource::new(&mut self.owned_frames);
        for page in 0..got_pages {
            let gva = self.program.got_virtual + page * PAGE_SIZE;
            let pa = load.new_got_physical + page * PAGE_SIZE;
            let attributes = stonelink::paging::PageAttributes::GLOBAL
                | stonelink::paging::PageAttributes::NO_EXECUTE;
            match table.remap_page(&mut frames, gva, pa, attributes) {
                Ok(()) => {}
                Err(PagingError::Unmapped(_)) => {
                    table.map_page(&mut frames, gva, pa, attributes)?;
                }
                Err(err) => return Err(err),
            }
        }

        self.program.got_physical = load.new_got_physical;
        self.program.got_size = load.new_got_size;
        debug!(
            "merged module: got {:#x} ({:#x} bytes) replaces {:#x} ({:#x} bytes), {} spans",
            load.new_got_physical,
            load.new_got_size,
            load.old_got_physical,
            load.old_got_size,
            load.module_spans.len()
        );
        self.vt.invalidate_caches();
        Ok(())
    }

    /// Looks for a GOT entry flagging a pending module whose placed span
    /// covers the faulting guest-physical address: the module is resolved
    /// and already laid out by the linker, but not yet merged into this
    /// guest. Returns the entry's byte offset for the dynamic-load path.
    pub(crate) fn pending_module_got_offset(&self, gpa: u64) -> Option<u64> {
        use stonelink::linker::{GotEntry, SectionKind, GOT_ENTRY_SIZE};

        let ctx = self.linker.as_ref()?;
        let entry_count = self.program.got_size / GOT_ENTRY_SIZE;
        for index in 2..entry_count {
            let address = self.program.got_physical + index * GOT_ENTRY_SIZE;
            let entry =
                GotEntry::from_bytes(unsafe { &*(address as *const [u8; GOT_ENTRY_SIZE as usize]) });
            if entry.module_id == 0 {
                break;
            }
            if self.loaded_modules.contains_key(&entry.module_id)
                || entry.is_bound()
                || !entry.is_resolved()
            {
                continue;
            }
            let Some(module) = ctx.module(entry.module_id) else {
                continue;
            };
            // Guest-physical equals host-physical for placed sections, so
            // the layout's spans are directly comparable with the fault.
            for kind in SectionKind::LOADABLE {
                let section = module.section(kind);
                if section.size != 0
                    && section.physical_start != 0
                    && gpa >= section.physical_start
                    && gpa < section.physical_start + section.size
                {
                    return Some(index * GOT_ENTRY_SIZE);
                }
            }
        }
        None
    }

    /// Marks GOT entries of modules this VM has not loaded as unresolved so
    /// the PLT faults them in on first use.
    pub(crate) fn invalidate_unloaded_got_entries(&mut self) {
        use stonelink::linker::{GotEntry, GOT_ENTRY_SIZE};

        let entry_count = self.program.got_size / GOT_ENTRY_SIZE;
        for index in 2..entry_count {
            let address = self.program.got_physical + index * GOT_ENTRY_SIZE;
            let bytes =
                unsafe { &mut *(address as *mut [u8; GOT_ENTRY_SIZE as usize]) };
            let mut entry = GotEntry::from_bytes(bytes);
            if entry.module_id == 0 {
                break;
            }
            if entry.is_bound() && !self.loaded_modules.contains_key(&entry.module_id) {
                trace!("unbinding entry of unloaded module {:#x}", entry.module_id);
                entry.set_bound(false);
                *bytes = entry.to_bytes();
            }
        }
    }

    /// Locates a nested paging structure entry from `table` using `index`,
    /// initializing it from the pool when empty. `table` must be a PML4,
    /// PDPT or PD; not a PT.
    fn walk_table<'a>(
        &mut self,
        table: &'a mut NestedPagingStructure,
        index: usize,
    ) -> &'a mut NestedPagingStructureEntry {
        let entry = &mut table.entries[index];

        if entry.0 == 0 {
            assert!(
                self.used_nps_count < self.nested_paging_structures.len(),
                "all preallocated nested paging structures exhausted",
            );
            let next_table = addr_of!(self.nested_paging_structures[self.used_nps_count]) as u64;
            entry.set_translation(
                next_table,
                self.vt.nps_entry_flags(NestedPagingStructureEntryType::Rwx),
            );
            self.used_nps_count += 1;
        }
        entry
    }
}

impl Drop for Vm {
    /// Owned frames go back in reverse allocation order; the caller is
    /// responsible for detaching the VM from the routing table first.
    fn drop(&mut self) {
        if !self.mapped_vectors.is_empty() {
            error!("VM {} dropped while still routed", self.id);
        }
        self.channels.interrupts.clear();
        frame::release_all(&mut self.owned_frames);
    }
}

/// Checks whether the current processor is an Intel processor (as opposed
/// to AMD).
fn is_intel() -> bool {
    &cpu_vendor() == b"GenuineIntel"
}
