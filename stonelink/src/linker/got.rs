//! The global offset table.
//!
//! The table is a single ordered array shared by the whole image. Entry 0 is
//! a reserved sentinel and entry 1 stands for `_GLOBAL_OFFSET_TABLE_`
//! itself; neither ever resolves. The in-memory layout is what the guest
//! sees: PLT stubs index the array with `got_index * 0x38` and test the
//! bound bit at offset 8 of an entry.

use alloc::{collections::BTreeMap, vec::Vec};

use super::{LinkerError, SectionKind, GOT_SYMBOL_ID};

/// Byte size of one entry; baked into the PLT stub displacements.
pub const GOT_ENTRY_SIZE: u64 = 0x38;

/// `flags` bit 0: `entry_value` holds the final runtime address.
pub const GOT_ENTRY_BOUND: u64 = 1 << 0;
/// `flags` bit 1: the defining module of the symbol is known.
pub const GOT_ENTRY_RESOLVED: u64 = 1 << 1;

/// One GOT entry, exactly as laid out in guest memory.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct GotEntry {
    /// Final runtime virtual address of the symbol, valid once bound.
    pub entry_value: u64, // +0x00
    /// [`GOT_ENTRY_BOUND`] | [`GOT_ENTRY_RESOLVED`].
    pub flags: u64, // +0x08
    /// Module defining the symbol.
    pub module_id: u64, // +0x10
    /// The symbol this entry stands for.
    pub symbol_id: u64, // +0x18
    /// Offset of the symbol within its owning section.
    pub symbol_value: u64, // +0x20
    /// Byte size of the symbol.
    pub symbol_size: u64, // +0x28
    /// Offset of the symbol name in the name blob.
    pub symbol_name_offset: u32, // +0x30
    /// [`super::SectionKind`] of the owning section.
    pub section_kind: u8, // +0x34
    /// Function or object.
    pub symbol_type: u8, // +0x35
    /// Local, global or weak.
    pub symbol_scope: u8, // +0x36
    /// Pads the entry to its fixed size.
    pub reserved: u8, // +0x37
}

const _: () = assert!(core::mem::size_of::<GotEntry>() == GOT_ENTRY_SIZE as usize);

impl GotEntry {
    /// Whether the defining module of the symbol is known.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.flags & GOT_ENTRY_RESOLVED != 0
    }

    /// Whether `entry_value` holds the final runtime address.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.flags & GOT_ENTRY_BOUND != 0
    }

    /// Sets or clears the resolved flag; clearing also unbinds.
    pub fn set_resolved(&mut self, resolved: bool) {
        if resolved {
            self.flags |= GOT_ENTRY_RESOLVED;
        } else {
            self.flags &= !(GOT_ENTRY_RESOLVED | GOT_ENTRY_BOUND);
        }
    }

    /// Sets or clears the bound flag.
    pub fn set_bound(&mut self, bound: bool) {
        if bound {
            self.flags |= GOT_ENTRY_BOUND;
        } else {
            self.flags &= !GOT_ENTRY_BOUND;
        }
    }

    /// The owning section's kind, decoded.
    pub fn section_kind(&self) -> Result<SectionKind, LinkerError> {
        SectionKind::try_from(self.section_kind)
    }

    /// Serializes the entry little-endian into its 0x38-byte image.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; GOT_ENTRY_SIZE as usize] {
        let mut out = [0u8; GOT_ENTRY_SIZE as usize];
        out[0x00..0x08].copy_from_slice(&self.entry_value.to_le_bytes());
        out[0x08..0x10].copy_from_slice(&self.flags.to_le_bytes());
        out[0x10..0x18].copy_from_slice(&self.module_id.to_le_bytes());
        out[0x18..0x20].copy_from_slice(&self.symbol_id.to_le_bytes());
        out[0x20..0x28].copy_from_slice(&self.symbol_value.to_le_bytes());
        out[0x28..0x30].copy_from_slice(&self.symbol_size.to_le_bytes());
        out[0x30..0x34].copy_from_slice(&self.symbol_name_offset.to_le_bytes());
        out[0x34] = self.section_kind;
        out[0x35] = self.symbol_type;
        out[0x36] = self.symbol_scope;
        out[0x37] = self.reserved;
        out
    }

    /// Decodes an entry from its 0x38-byte image.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; GOT_ENTRY_SIZE as usize]) -> Self {
        Self {
            entry_value: u64::from_le_bytes(bytes[0x00..0x08].try_into().unwrap()),
            flags: u64::from_le_bytes(bytes[0x08..0x10].try_into().unwrap()),
            module_id: u64::from_le_bytes(bytes[0x10..0x18].try_into().unwrap()),
            symbol_id: u64::from_le_bytes(bytes[0x18..0x20].try_into().unwrap()),
            symbol_value: u64::from_le_bytes(bytes[0x20..0x28].try_into().unwrap()),
            symbol_size: u64::from_le_bytes(bytes[0x28..0x30].try_into().unwrap()),
            symbol_name_offset: u32::from_le_bytes(bytes[0x30..0x34].try_into().unwrap()),
            section_kind: bytes[0x34],
            symbol_type: bytes[0x35],
            symbol_scope: bytes[0x36],
            reserved: bytes[0x37],
        }
    }
}

/// The ordered entry array plus the symbol-id index. A symbol's index is
/// stable from the moment it is first introduced, and no symbol ever has
/// two entries.
#[derive(Debug)]
pub(crate) struct GotTable {
    entries: Vec<GotEntry>,
    index: BTreeMap<u64, u64>,
}

impl GotTable {
    pub(crate) fn new() -> Self {
        let sentinel = GotEntry::default();
        let got_self = GotEntry {
            symbol_id: GOT_SYMBOL_ID,
            ..GotEntry::default()
        };
        let mut index = BTreeMap::new();
        let _ = index.insert(GOT_SYMBOL_ID, 1);
        Self {
            entries: alloc::vec![sentinel, got_self],
            index,
        }
    }

    pub(crate) fn entries(&self) -> &[GotEntry] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [GotEntry] {
        &mut self.entries
    }

    pub(crate) fn index_of(&self, symbol_id: u64) -> Option<u64> {
        self.index.get(&symbol_id).copied()
    }

    /// Returns the entry for `symbol_id`, appending a fresh one when the
    /// symbol is seen for the first time.
    pub(crate) fn entry_or_insert(&mut self, symbol_id: u64) -> &mut GotEntry {
        if let Some(idx) = self.index_of(symbol_id) {
            return &mut self.entries[idx as usize];
        }
        let idx = self.entries.len() as u64;
        self.entries.push(GotEntry {
            symbol_id,
            ..GotEntry::default()
        });
        let _ = self.index.insert(symbol_id, idx);
        &mut self.entries[idx as usize]
    }

    /// Byte image of the whole table, in entry order.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * GOT_ENTRY_SIZE as usize);
        for entry in &self.entries {
            out.extend_from_slice(&entry.to_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_layout_is_stable() {
        let entry = GotEntry {
            entry_value: 0x1122_3344_5566_7788,
            flags: GOT_ENTRY_BOUND | GOT_ENTRY_RESOLVED,
            module_id: 2,
            symbol_id: 3,
            symbol_value: 4,
            symbol_size: 5,
            symbol_name_offset: 6,
            section_kind: SectionKind::Text as u8,
            symbol_type: 1,
            symbol_scope: 1,
            reserved: 0,
        };
        let bytes = entry.to_bytes();
        assert_eq!(&bytes[0..8], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(bytes[8] & 0b11, 0b11);
        let decoded = GotEntry::from_bytes(&bytes);
        assert_eq!(decoded.symbol_id, 3);
        assert!(decoded.is_bound());
    }

    #[test]
    fn index_is_stable_and_unique() {
        let mut got = GotTable::new();
        let first = {
            let _ = got.entry_or_insert(77);
            got.index_of(77).unwrap()
        };
        let _ = got.entry_or_insert(88);
        let _ = got.entry_or_insert(77);
        assert_eq!(got.index_of(77).unwrap(), first);
        let count = got.entries().iter().filter(|e| e.symbol_id == 77).count();
        assert_eq!(count, 1);
    }
}
