//! Relocation records and the arithmetic that applies them.

use alloc::vec::Vec;
use log::error;

use super::{GotTable, LinkerContext, LinkerError, ModuleImage, RelocKind, SectionKind, GOT_ENTRY_SIZE, GOT_SYMBOL_ID};

/// Byte size of one relocation record as stored in the emitted table.
pub const RELOCATION_ENTRY_SIZE: u64 = 0x20;

/// One patch to apply when the image is laid out.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct RelocationEntry {
    /// The referenced symbol.
    pub symbol_id: u64, // +0x00
    /// Offset of the patch site within the target section.
    pub offset: u64, // +0x08
    /// Constant added into the relocation arithmetic.
    pub addend: i64, // +0x10
    /// [`RelocKind`] code.
    pub kind: u8, // +0x18
    /// [`SectionKind`] of the patched section.
    pub section_kind: u8, // +0x19
    /// Pads the record to its fixed size.
    pub reserved: [u8; 6], // +0x1a
}

const _: () = assert!(core::mem::size_of::<RelocationEntry>() == RELOCATION_ENTRY_SIZE as usize);

impl RelocationEntry {
    /// Builds a record for a patch at `offset` within `section`.
    #[must_use]
    pub fn new(symbol_id: u64, section: SectionKind, kind: RelocKind, offset: u64, addend: i64) -> Self {
        Self {
            symbol_id,
            offset,
            addend,
            kind: kind as u8,
            section_kind: section as u8,
            reserved: [0; 6],
        }
    }

    /// Serializes the record little-endian into its 0x20-byte image.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; RELOCATION_ENTRY_SIZE as usize] {
        let mut out = [0u8; RELOCATION_ENTRY_SIZE as usize];
        out[0x00..0x08].copy_from_slice(&self.symbol_id.to_le_bytes());
        out[0x08..0x10].copy_from_slice(&self.offset.to_le_bytes());
        out[0x10..0x18].copy_from_slice(&self.addend.to_le_bytes());
        out[0x18] = self.kind;
        out[0x19] = self.section_kind;
        out
    }

    /// Decodes a record from its 0x20-byte image.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; RELOCATION_ENTRY_SIZE as usize]) -> Self {
        Self {
            symbol_id: u64::from_le_bytes(bytes[0x00..0x08].try_into().unwrap()),
            offset: u64::from_le_bytes(bytes[0x08..0x10].try_into().unwrap()),
            addend: i64::from_le_bytes(bytes[0x10..0x18].try_into().unwrap()),
            kind: bytes[0x18],
            section_kind: bytes[0x19],
            reserved: [0; 6],
        }
    }
}

/// Inputs to the relocation formulas, in the notation of the arithmetic
/// table: `S` symbol runtime value, `A` addend, `P` patch-site address, `G`
/// GOT index times entry size, `B` GOT runtime base, `L` PLT stub address.
#[derive(Clone, Copy, Debug, Default)]
pub struct RelocationInputs {
    /// `S`: the symbol's runtime value.
    pub s: u64,
    /// `A`: the addend.
    pub a: i64,
    /// `P`: the absolute address of the patch site.
    pub p: u64,
    /// `G`: the symbol's GOT index times the entry size.
    pub g: u64,
    /// `B`: the GOT runtime base.
    pub b: u64,
    /// `L`: the symbol's PLT stub address.
    pub l: u64,
}

/// Computes the value a relocation writes, before truncation to the patch
/// width.
#[must_use]
pub fn apply_relocation(kind: RelocKind, inputs: RelocationInputs) -> u64 {
    let RelocationInputs { s, a, p, g, b, l } = inputs;
    let a = a as u64;
    match kind {
        RelocKind::Abs32 | RelocKind::Abs32S | RelocKind::Abs64 => s.wrapping_add(a),
        RelocKind::Pc32 | RelocKind::Pc64 => s.wrapping_add(a).wrapping_sub(p),
        RelocKind::Got64 => g.wrapping_add(a),
        RelocKind::GotOff64 => s.wrapping_add(a).wrapping_sub(b),
        RelocKind::GotPc64 => b.wrapping_add(a).wrapping_sub(p),
        RelocKind::PltOff64 => l.wrapping_sub(b),
    }
}

/// The dual of [`apply_relocation`] for the kinds whose value depends on
/// `S`: recovers the symbol value from a patched word.
#[must_use]
pub fn recover_symbol_value(kind: RelocKind, value: u64, inputs: RelocationInputs) -> Option<u64> {
    let RelocationInputs { a, p, b, .. } = inputs;
    let a = a as u64;
    match kind {
        RelocKind::Abs64 => Some(value.wrapping_sub(a)),
        RelocKind::Abs32 | RelocKind::Abs32S => Some((value & 0xffff_ffff).wrapping_sub(a) & 0xffff_ffff),
        RelocKind::Pc64 => Some(value.wrapping_add(p).wrapping_sub(a)),
        RelocKind::Pc32 => Some(
            u64::from((value as u32).wrapping_add(p as u32).wrapping_sub(a as u32)),
        ),
        RelocKind::GotOff64 => Some(value.wrapping_add(b).wrapping_sub(a)),
        RelocKind::Got64 | RelocKind::GotPc64 | RelocKind::PltOff64 => None,
    }
}

fn patch(section_data: &mut [u8], offset: u64, width: usize, value: u64) -> Result<(), LinkerError> {
    let offset = offset as usize;
    if offset + width > section_data.len() {
        return Err(LinkerError::SizeMismatch { section_id: 0 });
    }
    section_data[offset..offset + width].copy_from_slice(&value.to_le_bytes()[..width]);
    Ok(())
}

/// Applies every relocation of `module` against the bound GOT. Idempotent:
/// each application rewrites the patch site from the bound values.
pub(super) fn link_module(
    module: &mut ModuleImage,
    got: &GotTable,
    got_virtual_base: u64,
) -> Result<(), LinkerError> {
    let reloc_bytes = core::mem::take(&mut module.sections[SectionKind::RelocationTable as usize].data);
    let result = link_module_inner(module, got, got_virtual_base, &reloc_bytes);
    module.sections[SectionKind::RelocationTable as usize].data = reloc_bytes;
    result
}

fn link_module_inner(
    module: &mut ModuleImage,
    got: &GotTable,
    got_virtual_base: u64,
    reloc_bytes: &[u8],
) -> Result<(), LinkerError> {
    for chunk in reloc_bytes.chunks_exact(RELOCATION_ENTRY_SIZE as usize) {
        let entry = RelocationEntry::from_bytes(chunk.try_into().unwrap());
        let kind = RelocKind::try_from(entry.kind)?;
        let section = SectionKind::try_from(entry.section_kind)?;

        let got_index = got.index_of(entry.symbol_id);
        let (s, g) = match got_index {
            Some(index) => {
                let got_entry = &got.entries()[index as usize];
                if !got_entry.is_bound() && entry.symbol_id != GOT_SYMBOL_ID {
                    error!("unresolved symbol {:#x} referenced by relocation", entry.symbol_id);
                    return Err(LinkerError::UnresolvedSymbol(entry.symbol_id));
                }
                (got_entry.entry_value, index * GOT_ENTRY_SIZE)
            }
            // Only `_GLOBAL_OFFSET_TABLE_` itself may live outside the index,
            // and only GOTPC64 does not consult the symbol value.
            None if entry.symbol_id == GOT_SYMBOL_ID && kind == RelocKind::GotPc64 => (0, 0),
            None => return Err(LinkerError::UnresolvedSymbol(entry.symbol_id)),
        };

        let l = match kind {
            RelocKind::PltOff64 => {
                let plt_offset = module
                    .plt_offset(entry.symbol_id)
                    .ok_or(LinkerError::MissingSymbol(entry.symbol_id))?;
                module.section(SectionKind::Plt).virtual_start + plt_offset
            }
            _ => 0,
        };

        let p = module.section(section).virtual_start + entry.offset;
        let value = apply_relocation(
            kind,
            RelocationInputs {
                s,
                a: entry.addend,
                p,
                g,
                b: got_virtual_base,
                l,
            },
        );
        patch(
            &mut module.section_mut(section).data,
            entry.offset,
            kind.width(),
            value,
        )?;
    }
    Ok(())
}

impl LinkerContext {
    /// Phase four: applies every module's relocations. Requires the previous
    /// phases; idempotent afterwards.
    pub fn link_program(&mut self) -> Result<(), LinkerError> {
        for module in self.modules.values_mut() {
            link_module(module, &self.got, self.got_virtual_base)?;
        }
        Ok(())
    }

    /// Serializes the per-module relocation tables, each prefixed with the
    /// module id and byte length.
    #[must_use]
    pub fn relocation_table_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for module in self.modules.values() {
            let table = &module.section(SectionKind::RelocationTable).data;
            if table.is_empty() {
                continue;
            }
            out.extend_from_slice(&module.id.to_le_bytes());
            out.extend_from_slice(&(table.len() as u64).to_le_bytes());
            out.extend_from_slice(table);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_recovers_symbol_and_addend() {
        let inputs = RelocationInputs {
            s: 0x0000_7000_0000_1234,
            a: 0x40,
            p: 0x0000_7000_0000_9000,
            g: 3 * GOT_ENTRY_SIZE,
            b: super::super::GOT_VIRTUAL_BASE,
            l: 0x0000_7000_0000_a000,
        };
        for kind in [
            RelocKind::Abs64,
            RelocKind::Pc64,
            RelocKind::GotOff64,
        ] {
            let value = apply_relocation(kind, inputs);
            let recovered = recover_symbol_value(kind, value, inputs).unwrap();
            assert_eq!(recovered, inputs.s, "{kind:?}");
        }
    }

    #[test]
    fn round_trip_32bit_kinds() {
        let inputs = RelocationInputs {
            s: 0x4000_1234,
            a: -8,
            p: 0x4000_9000,
            ..RelocationInputs::default()
        };
        for kind in [RelocKind::Abs32, RelocKind::Abs32S, RelocKind::Pc32] {
            let value = apply_relocation(kind, inputs) & 0xffff_ffff;
            let recovered = recover_symbol_value(kind, value, inputs).unwrap();
            assert_eq!(recovered, inputs.s, "{kind:?}");
        }
    }

    #[test]
    fn got_relative_formulas() {
        let inputs = RelocationInputs {
            s: 0,
            a: 6,
            p: 0x1000,
            g: 2 * GOT_ENTRY_SIZE,
            b: 0x8000_0000,
            l: 0x2000,
        };
        assert_eq!(apply_relocation(RelocKind::Got64, inputs), 2 * GOT_ENTRY_SIZE + 6);
        assert_eq!(apply_relocation(RelocKind::GotPc64, inputs), 0x8000_0000 + 6 - 0x1000);
        assert_eq!(apply_relocation(RelocKind::PltOff64, inputs), 0x2000u64.wrapping_sub(0x8000_0000));
    }

    #[test]
    fn relocation_entry_round_trip() {
        let entry = RelocationEntry::new(9, SectionKind::Text, RelocKind::Pc32, 0x123, -4);
        let decoded = RelocationEntry::from_bytes(&entry.to_bytes());
        assert_eq!(decoded.symbol_id, 9);
        assert_eq!(decoded.addend, -4);
        assert_eq!(RelocKind::try_from(decoded.kind).unwrap(), RelocKind::Pc32);
    }
}
