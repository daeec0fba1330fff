//! The module-ingest manifest.
//!
//! The toolchain describes compiled modules in a JSON document; this module
//! parses it and writes the records the linker later reads back. The same
//! path seeds demonstration guests.

use alloc::{string::String, vec::Vec};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    db::{io::BlockIo, Db, DbError},
    linker::SystemCatalog,
};

/// The whole document: every module the toolchain produced.
#[derive(Debug, Serialize, Deserialize)]
pub struct Manifest {
    /// The modules to ingest.
    pub modules: Vec<ModuleManifest>,
}

/// One translation unit.
#[derive(Debug, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Stable module id.
    pub id: u64,
    /// Module name.
    pub name: String,
    /// The module's sections.
    pub sections: Vec<SectionManifest>,
}

/// One section of a module.
#[derive(Debug, Serialize, Deserialize)]
pub struct SectionManifest {
    /// Stable section id, unique across modules.
    pub id: u64,
    /// Section name.
    pub name: String,
    /// Section kind as stored in the database (see the linker's kinds).
    pub kind: u8,
    /// Required alignment of the content within its kind's span.
    pub alignment: u64,
    /// Virtual size; for every kind but bss this must equal `data.len()`.
    pub size: u64,
    /// Content bytes; empty for bss.
    #[serde(default)]
    pub data: Vec<u8>,
    /// Symbols this section defines.
    #[serde(default)]
    pub symbols: Vec<SymbolManifest>,
    /// Relocations patching this section.
    #[serde(default)]
    pub relocations: Vec<RelocationManifest>,
}

/// One symbol definition.
#[derive(Debug, Serialize, Deserialize)]
pub struct SymbolManifest {
    /// Stable symbol id, unique across modules.
    pub id: u64,
    /// Symbol name.
    pub name: String,
    /// Function or object (see the linker's symbol types).
    pub symbol_type: u8,
    /// Local, global or weak (see the linker's symbol scopes).
    pub scope: u8,
    /// Offset within the owning section.
    pub value: u64,
    /// Byte size of the symbol.
    pub size: u64,
}

/// One relocation record.
#[derive(Debug, Serialize, Deserialize)]
pub struct RelocationManifest {
    /// Stable relocation id, unique within the table.
    pub id: u64,
    /// The referenced symbol; ignored for `_GLOBAL_OFFSET_TABLE_`.
    #[serde(default)]
    pub symbol_id: u64,
    /// Name of the referenced symbol.
    pub symbol_name: String,
    /// Section defining the referenced symbol; zero for
    /// `_GLOBAL_OFFSET_TABLE_`.
    #[serde(default)]
    pub symbol_section_id: u64,
    /// Relocation kind code (see the linker's kinds).
    pub kind: u8,
    /// Patch-site offset within the patched section.
    pub offset: u64,
    /// Constant added into the relocation arithmetic.
    pub addend: i64,
}

impl Manifest {
    /// Parses a manifest document from its JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Writes every module, section, symbol and relocation into the system
    /// schema of `db`.
    pub fn ingest<I: BlockIo>(&self, db: &mut Db<I>) -> Result<(), DbError> {
        let catalog = SystemCatalog::open(db)?;

        for module in &self.modules {
            let mut record = db.create_record(catalog.modules);
            let _ = record.set_u64("id", module.id).set_string("name", &module.name);
            db.upsert_record(&record)?;

            for section in &module.sections {
                let mut record = db.create_record(catalog.sections);
                let _ = record
                    .set_u64("id", section.id)
                    .set_u64("module_id", module.id)
                    .set_u8("type", section.kind)
                    .set_string("name", &section.name)
                    .set_u64("size", section.size)
                    .set_u64("alignment", section.alignment)
                    .set_bytes("value", &section.data);
                db.upsert_record(&record)?;

                for symbol in &section.symbols {
                    let mut record = db.create_record(catalog.symbols);
                    let _ = record
                        .set_u64("id", symbol.id)
                        .set_u64("section_id", section.id)
                        .set_u8("type", symbol.symbol_type)
                        .set_u8("scope", symbol.scope)
                        .set_u64("value", symbol.value)
                        .set_u64("size", symbol.size)
                        .set_string("name", &symbol.name);
                    db.upsert_record(&record)?;
                }

                for relocation in &section.relocations {
                    let mut record = db.create_record(catalog.relocations);
                    let _ = record
                        .set_u64("id", relocation.id)
                        .set_u64("section_id", section.id)
                        .set_u64("symbol_id", relocation.symbol_id)
                        .set_string("symbol_name", &relocation.symbol_name)
                        .set_u64("symbol_section_id", relocation.symbol_section_id)
                        .set_u8("type", relocation.kind)
                        .set_u64("offset", relocation.offset)
                        .set_i64("addend", relocation.addend);
                    db.upsert_record(&record)?;
                }
            }
            debug!("module {} ({:#x}) ingested", module.name, module.id);
        }
        db.persist()?;
        info!("{} modules ingested", self.modules.len());
        Ok(())
    }
}
