//! Layout phases: sizing, address binding, and GOT value binding.

use crate::page_align_up;
use log::debug;

use super::{LinkerContext, LinkerError, SectionKind};

/// Per-module metadata prefix: id, name offset, physical and virtual start.
const METADATA_MODULE_WORDS: u64 = 4;
/// Per-section metadata record: kind, physical start, virtual start, size.
const METADATA_SECTION_WORDS: u64 = 4;
/// Terminator after each module and after the whole list.
const METADATA_TERMINATOR_WORDS: u64 = 4;

impl LinkerContext {
    /// Phase one: computes the byte footprint of the program, the GOT, the
    /// relocation table, the metadata and the symbol table. Every component
    /// is rounded up to whole pages.
    pub fn calculate_program_size(&mut self) -> Result<(), LinkerError> {
        let mut program_size = 0u64;
        let mut relocation_table_size = 0u64;
        let mut metadata_words = 0u64;

        for module in self.modules.values() {
            metadata_words += METADATA_MODULE_WORDS;
            for kind in SectionKind::LOADABLE {
                let section = module.section(kind);
                if section.size != 0 {
                    metadata_words += METADATA_SECTION_WORDS;
                    program_size += page_align_up(section.size);
                }
            }
            metadata_words += METADATA_TERMINATOR_WORDS;

            let reloc = module.section(SectionKind::RelocationTable);
            if reloc.size != 0 {
                // Module id and byte length prefix each table.
                relocation_table_size += 16 + reloc.size;
            }
        }
        metadata_words += METADATA_TERMINATOR_WORDS;

        self.program_size = page_align_up(program_size);
        self.got_size = page_align_up(self.got.to_bytes().len() as u64);
        self.relocation_table_size = page_align_up(relocation_table_size);
        self.metadata_size = page_align_up(metadata_words * 8);
        self.symbol_table_size = page_align_up(self.symbol_blob.len() as u64);

        debug!(
            "program {:#x} got {:#x} relocations {:#x} metadata {:#x} symbols {:#x}",
            self.program_size,
            self.got_size,
            self.relocation_table_size,
            self.metadata_size,
            self.symbol_table_size
        );
        Ok(())
    }

    /// Phase two: assigns physical and virtual starts kind-major; all text,
    /// then all rodata, and so on, each module's section padded to a page.
    /// Sections placed by an earlier bind keep their addresses, so modules
    /// built after the initial image append at the cursors. The GOT virtual
    /// base stays at its fixed address.
    pub fn bind_linear_addresses(&mut self) -> Result<(), LinkerError> {
        let mut physical = if self.cursor_physical == 0 {
            self.program_start_physical
        } else {
            self.cursor_physical
        };
        let mut virtual_ = if self.cursor_virtual == 0 {
            self.program_start_virtual
        } else {
            self.cursor_virtual
        };

        for kind in SectionKind::LOADABLE {
            for module in self.modules.values_mut() {
                let first_placement = module.physical_start == 0;
                let section = module.section_mut(kind);
                if section.size == 0 || section.physical_start != 0 {
                    continue;
                }
                section.size = page_align_up(section.size);
                section.physical_start = physical;
                section.virtual_start = virtual_;
                let placed_size = section.size;
                if first_placement {
                    module.physical_start = physical;
                    module.virtual_start = virtual_;
                }
                physical += placed_size;
                virtual_ += placed_size;
            }
        }
        self.cursor_physical = physical;
        self.cursor_virtual = virtual_;
        Ok(())
    }

    /// Phase three: computes the runtime value of every resolved GOT entry
    /// and captures the entry-point address.
    pub fn bind_got_entry_values(&mut self) -> Result<(), LinkerError> {
        for index in 0..self.got.entries().len() {
            let (resolved, bound, module_id, section_kind, symbol_value) = {
                let entry = &self.got.entries()[index];
                (
                    entry.is_resolved(),
                    entry.is_bound(),
                    entry.module_id,
                    entry.section_kind()?,
                    entry.symbol_value,
                )
            };
            if !resolved || bound {
                continue;
            }
            let module = self
                .modules
                .get(&module_id)
                .ok_or(LinkerError::MissingModule(module_id))?;
            let value = module.section(section_kind).virtual_start + symbol_value;
            let entry = &mut self.got.entries_mut()[index];
            entry.entry_value = value;
            entry.set_bound(true);
        }

        if let Some(symbol_id) = self.entry_point_symbol_id {
            let index = self
                .got
                .index_of(symbol_id)
                .ok_or(LinkerError::UnresolvedSymbol(symbol_id))?;
            let entry = &self.got.entries()[index as usize];
            if !entry.is_bound() {
                return Err(LinkerError::UnresolvedSymbol(symbol_id));
            }
            self.entry_point_virtual = entry.entry_value;
            debug!("entry point bound at {:#x}", self.entry_point_virtual);
        }
        Ok(())
    }

    /// Serializes the module metadata area.
    #[must_use]
    pub fn metadata_bytes(&self) -> alloc::vec::Vec<u8> {
        let mut out = alloc::vec::Vec::new();
        let put = |value: u64, out: &mut alloc::vec::Vec<u8>| {
            out.extend_from_slice(&value.to_le_bytes());
        };
        for module in self.modules.values() {
            put(module.id, &mut out);
            put(module.name_offset, &mut out);
            put(module.physical_start, &mut out);
            put(module.virtual_start, &mut out);
            for kind in SectionKind::LOADABLE {
                let section = module.section(kind);
                if section.size == 0 {
                    continue;
                }
                put(kind as u64, &mut out);
                put(section.physical_start, &mut out);
                put(section.virtual_start, &mut out);
                put(section.size, &mut out);
            }
            for _ in 0..METADATA_TERMINATOR_WORDS {
                put(0, &mut out);
            }
        }
        for _ in 0..METADATA_TERMINATOR_WORDS {
            put(0, &mut out);
        }
        out
    }
}
