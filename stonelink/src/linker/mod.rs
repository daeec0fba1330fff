//! The dynamic linker: materializes relocatable modules from the database
//! into a single executable image with a shared global offset table,
//! per-module procedure linkage tables, and an applied relocation set.
//!
//! A build runs in four mandatory phases, in order:
//! 1. [`LinkerContext::calculate_program_size`]
//! 2. [`LinkerContext::bind_linear_addresses`]
//! 3. [`LinkerContext::bind_got_entry_values`]
//! 4. [`LinkerContext::link_program`]
//!
//! Linking is idempotent after binding, so a caller may re-link after
//! loading additional modules into the same context.

mod build;
mod got;
mod layout;
mod relocate;

pub use build::{resolve_entry_symbol, SystemCatalog};
pub use got::{GotEntry, GOT_ENTRY_BOUND, GOT_ENTRY_RESOLVED, GOT_ENTRY_SIZE};
pub use relocate::{
    apply_relocation, recover_symbol_value, RelocationEntry, RelocationInputs,
    RELOCATION_ENTRY_SIZE,
};

use crate::db::DbError;
use alloc::{collections::BTreeMap, vec::Vec};
use got::GotTable;

/// Fixed guest-virtual base of the global offset table.
pub const GOT_VIRTUAL_BASE: u64 = 8 << 40;

/// Symbol id of `_GLOBAL_OFFSET_TABLE_` itself (GOT entry index 1; index 0
/// is the reserved sentinel).
pub const GOT_SYMBOL_ID: u64 = 1;

/// Section kinds, in placement order. Loadable kinds precede
/// [`SectionKind::RelocationTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SectionKind {
    /// Executable code.
    Text = 0,
    /// Read-only data.
    Rodata = 1,
    /// Read-only data carrying relocations.
    RodataReloc = 2,
    /// Writable data.
    Data = 3,
    /// Writable data carrying relocations.
    DataReloc = 4,
    /// Zero-initialized data; a size without content.
    Bss = 5,
    /// The synthesized procedure linkage table.
    Plt = 6,
    /// The emitted relocation records of a module.
    RelocationTable = 7,
    /// The global offset table.
    Got = 8,
    /// The guest stack span.
    Stack = 9,
    /// The guest heap span.
    Heap = 10,
}

impl SectionKind {
    /// Number of kinds; sizes the per-module section array.
    pub const COUNT: usize = 11;

    /// The kinds that occupy the program image, in placement order.
    pub const LOADABLE: [SectionKind; 7] = [
        SectionKind::Text,
        SectionKind::Rodata,
        SectionKind::RodataReloc,
        SectionKind::Data,
        SectionKind::DataReloc,
        SectionKind::Bss,
        SectionKind::Plt,
    ];

    /// Whether pages of this kind map executable.
    #[must_use]
    pub fn executable(self) -> bool {
        matches!(self, SectionKind::Text | SectionKind::Plt)
    }

    /// Whether pages of this kind map writable.
    #[must_use]
    pub fn writable(self) -> bool {
        matches!(
            self,
            SectionKind::Data
                | SectionKind::DataReloc
                | SectionKind::Bss
                | SectionKind::Stack
                | SectionKind::Heap
        )
    }
}

impl TryFrom<u8> for SectionKind {
    type Error = LinkerError;

    fn try_from(raw: u8) -> Result<Self, LinkerError> {
        match raw {
            0 => Ok(Self::Text),
            1 => Ok(Self::Rodata),
            2 => Ok(Self::RodataReloc),
            3 => Ok(Self::Data),
            4 => Ok(Self::DataReloc),
            5 => Ok(Self::Bss),
            6 => Ok(Self::Plt),
            7 => Ok(Self::RelocationTable),
            8 => Ok(Self::Got),
            9 => Ok(Self::Stack),
            10 => Ok(Self::Heap),
            other => Err(LinkerError::UnknownSectionKind(other)),
        }
    }
}

/// Relocation kinds with the arithmetic defined in [`apply_relocation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RelocKind {
    /// Absolute 32-bit, zero extended.
    Abs32 = 1,
    /// Absolute 32-bit, sign extended.
    Abs32S = 2,
    /// Absolute 64-bit.
    Abs64 = 3,
    /// PC-relative 32-bit.
    Pc32 = 4,
    /// PC-relative 64-bit.
    Pc64 = 5,
    /// Byte offset of the symbol's GOT entry.
    Got64 = 6,
    /// Symbol value relative to the GOT base.
    GotOff64 = 7,
    /// GOT base relative to the patch site.
    GotPc64 = 8,
    /// PLT stub address relative to the GOT base.
    PltOff64 = 9,
}

impl RelocKind {
    /// Width of the patch in bytes.
    #[must_use]
    pub fn width(self) -> usize {
        match self {
            RelocKind::Abs32 | RelocKind::Abs32S | RelocKind::Pc32 => 4,
            _ => 8,
        }
    }
}

impl TryFrom<u8> for RelocKind {
    type Error = LinkerError;

    fn try_from(raw: u8) -> Result<Self, LinkerError> {
        match raw {
            1 => Ok(Self::Abs32),
            2 => Ok(Self::Abs32S),
            3 => Ok(Self::Abs64),
            4 => Ok(Self::Pc32),
            5 => Ok(Self::Pc64),
            6 => Ok(Self::Got64),
            7 => Ok(Self::GotOff64),
            8 => Ok(Self::GotPc64),
            9 => Ok(Self::PltOff64),
            other => Err(LinkerError::UnknownRelocation(other)),
        }
    }
}

/// Symbol type: a data object.
pub const SYMBOL_TYPE_OBJECT: u8 = 0;
/// Symbol type: a function.
pub const SYMBOL_TYPE_FUNCTION: u8 = 1;

/// Symbol scope: visible within its module only.
pub const SYMBOL_SCOPE_LOCAL: u8 = 0;
/// Symbol scope: visible to every module.
pub const SYMBOL_SCOPE_GLOBAL: u8 = 1;
/// Symbol scope: global, overridable by a strong definition.
pub const SYMBOL_SCOPE_WEAK: u8 = 2;

/// Host CPU vendor; selects the hypercall opcode baked into PLT0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PltVendor {
    /// VT-x hosts; PLT0 uses `vmcall`.
    Intel,
    /// AMD-V hosts; PLT0 uses `vmmcall`.
    Amd,
}

/// Errors of module building, layout and linking. The caller must abort
/// the build; no partial image is ever handed out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkerError {
    /// A relocation referenced a symbol no module defines.
    UnresolvedSymbol(u64),
    /// A relocation carried an unknown kind code.
    UnknownRelocation(u8),
    /// A section carried an unknown kind code.
    UnknownSectionKind(u8),
    /// Section content disagreed with its declared size.
    SizeMismatch {
        /// The offending section.
        section_id: u64,
    },
    /// Buffered section offset disagreed with the declared alignment.
    AlignmentMismatch {
        /// The offending section.
        section_id: u64,
    },
    /// Two definitions claimed the same module id.
    ModuleIdCollision(u64),
    /// No module with this id exists in the database.
    MissingModule(u64),
    /// A referenced symbol could not be located.
    MissingSymbol(u64),
    /// The named entry-point symbol does not exist in any module.
    MissingEntryPoint,
    /// A recursive build made no progress over a full pass: a genuine
    /// dependency cycle. The caller may retry after another build pass.
    Stalled,
    /// The module database failed underneath the build.
    Db(DbError),
}

impl From<DbError> for LinkerError {
    fn from(err: DbError) -> Self {
        LinkerError::Db(err)
    }
}

/// One section of a module being linked. `data` stays empty for bss.
#[derive(Debug, Default)]
pub struct Section {
    /// Buffered content; relocations patch it in place.
    pub data: Vec<u8>,
    /// Virtual size; a page multiple once placed.
    pub size: u64,
    /// Physical start once placed, zero before.
    pub physical_start: u64,
    /// Virtual start once placed, zero before.
    pub virtual_start: u64,
}

/// A module materialized into the link context.
#[derive(Debug)]
pub struct ModuleImage {
    /// Stable module id from the database.
    pub id: u64,
    /// Offset of the module name in the symbol blob.
    pub name_offset: u64,
    /// Physical start of the module's first placed section.
    pub physical_start: u64,
    /// Virtual start of the module's first placed section.
    pub virtual_start: u64,
    sections: [Section; SectionKind::COUNT],
    plt_offsets: BTreeMap<u64, u64>,
}

impl ModuleImage {
    fn new(id: u64) -> Self {
        Self {
            id,
            name_offset: 0,
            physical_start: 0,
            virtual_start: 0,
            sections: Default::default(),
            plt_offsets: BTreeMap::new(),
        }
    }

    /// The module's section of the given kind.
    #[must_use]
    pub fn section(&self, kind: SectionKind) -> &Section {
        &self.sections[kind as usize]
    }

    fn section_mut(&mut self, kind: SectionKind) -> &mut Section {
        &mut self.sections[kind as usize]
    }

    /// PLT stub offset for `symbol_id`, when one was synthesized.
    #[must_use]
    pub fn plt_offset(&self, symbol_id: u64) -> Option<u64> {
        self.plt_offsets.get(&symbol_id).copied()
    }
}

/// Outcome of a module build request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The module was materialized into the context.
    Built,
    /// The module was already present; nothing changed.
    AlreadyLoaded,
}

/// The link context: every module built so far, the shared GOT, the symbol
/// name blob, and the bound layout.
#[derive(Debug)]
pub struct LinkerContext {
    /// Physical address the program region is linked at.
    pub program_start_physical: u64,
    /// Virtual address the program region is linked at.
    pub program_start_virtual: u64,
    /// Placement cursors; after the initial bind they mark the high-water
    /// marks new modules continue from. A dynamic load repoints the
    /// physical cursor at freshly allocated frames before rebinding.
    pub cursor_physical: u64,
    /// Virtual counterpart of [`LinkerContext::cursor_physical`].
    pub cursor_virtual: u64,
    /// Fixed virtual base of the global offset table.
    pub got_virtual_base: u64,
    /// The symbol the emitted image starts at, once resolved.
    pub entry_point_symbol_id: Option<u64>,
    /// Bound virtual address of the entry point.
    pub entry_point_virtual: u64,
    pub(crate) modules: BTreeMap<u64, ModuleImage>,
    pub(crate) got: GotTable,
    pub(crate) symbol_blob: Vec<u8>,
    pub(crate) vendor: PltVendor,
    pub(crate) for_guest: bool,
    /// Byte size of the program region; valid after sizing.
    pub program_size: u64,
    /// Byte size of the global offset table; valid after sizing.
    pub got_size: u64,
    /// Byte size of the relocation table; valid after sizing.
    pub relocation_table_size: u64,
    /// Byte size of the module metadata; valid after sizing.
    pub metadata_size: u64,
    /// Byte size of the symbol name table; valid after sizing.
    pub symbol_table_size: u64,
}

impl LinkerContext {
    #[must_use]
    pub fn new(
        program_start_physical: u64,
        program_start_virtual: u64,
        vendor: PltVendor,
        for_guest: bool,
    ) -> Self {
        Self {
            program_start_physical,
            program_start_virtual,
            cursor_physical: 0,
            cursor_virtual: 0,
            got_virtual_base: GOT_VIRTUAL_BASE,
            entry_point_symbol_id: None,
            entry_point_virtual: 0,
            modules: BTreeMap::new(),
            got: GotTable::new(),
            symbol_blob: Vec::new(),
            vendor,
            for_guest,
            program_size: 0,
            got_size: 0,
            relocation_table_size: 0,
            metadata_size: 0,
            symbol_table_size: 0,
        }
    }

    /// Every module built into this context, ascending by id.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleImage> {
        self.modules.values()
    }

    /// The module with the given id, if built.
    #[must_use]
    pub fn module(&self, id: u64) -> Option<&ModuleImage> {
        self.modules.get(&id)
    }

    /// The global offset table, in entry order.
    #[must_use]
    pub fn got_entries(&self) -> &[GotEntry] {
        self.got.entries()
    }

    /// The stable GOT index of a symbol, if it was ever referenced.
    #[must_use]
    pub fn got_index_of(&self, symbol_id: u64) -> Option<u64> {
        self.got.index_of(symbol_id)
    }

    /// The NUL-separated symbol and module name blob.
    #[must_use]
    pub fn symbol_blob(&self) -> &[u8] {
        &self.symbol_blob
    }

    /// True once every GOT entry other than the two permanent placeholders
    /// (the sentinel and the GOT self-entry) is resolved.
    #[must_use]
    pub fn is_all_symbols_resolved(&self) -> bool {
        let unresolved = self
            .got
            .entries()
            .iter()
            .filter(|entry| !entry.is_resolved())
            .count();
        unresolved == 2
    }
}
